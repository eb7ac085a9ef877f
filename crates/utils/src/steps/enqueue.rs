use std::sync::Arc;

use tracing::{error, info};

use crate::{
    pipeline::{Flow, ForwardContext, PipelineError, PipelineStep, StepFuture},
    queue::MessageQueue,
};

/// Step handing the transformed message over to the queue.
///
/// Only the rewritten header travels through the queue, the body is read
/// again from the content store at delivery time.
pub struct EnqueueStep {
    queue: Arc<dyn MessageQueue>,
}

impl EnqueueStep {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        info!(queue = queue.name(), "Enqueue step initialized");
        Self { queue }
    }
}

impl PipelineStep for EnqueueStep {
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a> {
        Box::pin(async move {
            let transformed = context
                .transformed
                .as_ref()
                .ok_or(PipelineError::MissingContext("transformed"))?;

            let json = transformed.to_queued().to_json().map_err(|e| {
                error!(
                    message_id = %transformed.message_id,
                    error = %e,
                    "Failed to serialize queued message"
                );
                PipelineError::EnqueueFailed(e.to_string())
            })?;

            let queue_id = self.queue.enqueue(&json).await.map_err(|e| {
                error!(
                    message_id = %transformed.message_id,
                    queue = self.queue.name(),
                    error = %e,
                    "Failed to enqueue message"
                );
                PipelineError::EnqueueFailed(e.to_string())
            })?;

            info!(
                message_id = %transformed.message_id,
                queue_id = %queue_id,
                recipients = ?transformed.recipients,
                "Message queued for delivery"
            );
            context.queue_id = Some(queue_id);
            Ok(Flow::Continue)
        })
    }

    fn name(&self) -> &str {
        "enqueue"
    }
}
