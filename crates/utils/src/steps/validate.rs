use tracing::{error, info};

use crate::pipeline::{Flow, ForwardContext, PipelineStep, StepFuture};

/// Step checking the notification shape and extracting the message reference.
#[derive(Debug, Default)]
pub struct ValidateStep;

impl PipelineStep for ValidateStep {
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a> {
        Box::pin(async move {
            let message = context.notification.validate().map_err(|e| {
                error!(error = %e, "Received invalid inbound notification");
                e
            })?;
            info!(
                message_id = %message.message_id,
                source = message.source.as_deref().unwrap_or_default(),
                recipients = ?message.original_recipients,
                "Accepted inbound notification"
            );
            context.message = Some(message);
            Ok(Flow::Continue)
        })
    }

    fn name(&self) -> &str {
        "validate"
    }
}
