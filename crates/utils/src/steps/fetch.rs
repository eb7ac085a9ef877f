use std::sync::Arc;

use tracing::{debug, error, info};

use crate::{
    pipeline::{Flow, ForwardContext, PipelineError, PipelineStep, StepFuture},
    storage::{content_key, ContentStore},
};

/// Step reading the raw message from the content store.
pub struct FetchStep {
    store: Arc<dyn ContentStore>,
    key_prefix: String,
}

impl FetchStep {
    pub fn new(store: Arc<dyn ContentStore>, key_prefix: String) -> Self {
        info!(store = store.name(), prefix = %key_prefix, "Fetch step initialized");
        Self { store, key_prefix }
    }
}

impl PipelineStep for FetchStep {
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a> {
        Box::pin(async move {
            let message_id = context.message()?.message_id.clone();
            let key = content_key(&self.key_prefix, &message_id);

            debug!(message_id = %message_id, key = %key, "Fetching raw message");
            let raw = self.store.fetch(&key).await.map_err(|e| {
                error!(
                    message_id = %message_id,
                    key = %key,
                    error = %e,
                    "Failed to fetch raw message"
                );
                PipelineError::FetchFailed(format!("{key}: {e}"))
            })?;

            debug!(message_id = %message_id, size = raw.len(), "Fetched raw message");
            context.raw = Some(raw);
            Ok(Flow::Continue)
        })
    }

    fn name(&self) -> &str {
        "fetch"
    }
}
