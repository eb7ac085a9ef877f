//! The message transform pipeline.
//!
//! A pipeline is an ordered list of [`PipelineStep`]s sharing a mutable
//! [`ForwardContext`]. Steps run strictly one after the other, the first
//! failing step aborts the run and a step may also end the run early with
//! [`Flow::Complete`] when there is nothing left to do. Concrete steps live
//! in the [`steps`](crate::steps) module.

use std::{future::Future, pin::Pin, sync::Arc};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    alias::{AliasDirectory, SuppressionPolicy},
    queue::MessageQueue,
    rewriter::HeaderPolicy,
    steps::{EnqueueStep, FetchStep, ResolveStep, RewriteStep, ValidateStep},
    storage::ContentStore,
    InboundNotification, RawMessageRef, ResolvedRecipient, TransformedMessage,
};

/// Boxed future type for pipeline steps, enabling async steps.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, PipelineError>> + Send + 'a>>;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The notification does not have the expected shape.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The raw message could not be read from the content store.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// The transformed message could not be handed to the queue.
    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    /// A step ran before the step producing its input.
    #[error("Missing pipeline context: {0}")]
    MissingContext(&'static str),
}

/// Tells the pipeline whether to run the remaining steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop here, the run is successful.
    Complete,
}

/// State shared by the steps of a single run.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    pub notification: InboundNotification,

    /// Set by validation.
    pub message: Option<RawMessageRef>,

    /// One entry per original recipient, in the original order.
    pub resolutions: Vec<(String, ResolvedRecipient)>,

    /// De-duplicated forwarding targets.
    pub recipients: Vec<String>,

    /// First original recipient with a forwarding target.
    pub original_recipient: Option<String>,

    /// Raw message as read from the content store.
    pub raw: Option<String>,

    pub transformed: Option<TransformedMessage>,

    /// Queue id assigned on enqueue.
    pub queue_id: Option<String>,
}

impl ForwardContext {
    pub fn new(notification: InboundNotification) -> Self {
        Self {
            notification,
            ..Default::default()
        }
    }

    pub fn message(&self) -> Result<&RawMessageRef, PipelineError> {
        self.message
            .as_ref()
            .ok_or(PipelineError::MissingContext("message"))
    }

    /// Message id for logging, empty until validation ran.
    pub fn message_id(&self) -> &str {
        self.message
            .as_ref()
            .map(|message| message.message_id.as_str())
            .unwrap_or_default()
    }

    /// Original recipients that resolved to a forwarding target.
    pub fn aliases(&self) -> Vec<String> {
        self.resolutions
            .iter()
            .filter(|(_, resolved)| resolved.target().is_some())
            .map(|(alias, _)| alias.clone())
            .collect()
    }
}

/// Trait for the steps of a [`Pipeline`].
pub trait PipelineStep: Send + Sync {
    /// Runs the step against the shared context.
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a>;

    /// Returns the name of this step.
    fn name(&self) -> &str;
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The transformed message was handed to the queue.
    Queued {
        message_id: String,
        queue_id: String,
        recipients: Vec<String>,
    },
    /// No original recipient resolved to a forwarding target.
    NoRecipients { message_id: String },
}

/// Ordered list of steps applied to every inbound notification.
pub struct Pipeline {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self { steps }
    }

    /// Builds the standard forwarding pipeline: validate, resolve, fetch,
    /// rewrite and enqueue.
    pub fn forwarding(
        directory: Arc<dyn AliasDirectory>,
        suppression: SuppressionPolicy,
        store: Arc<dyn ContentStore>,
        key_prefix: String,
        headers: HeaderPolicy,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self::new(vec![
            Box::new(ValidateStep),
            Box::new(ResolveStep::new(directory, suppression)),
            Box::new(FetchStep::new(store, key_prefix)),
            Box::new(RewriteStep::new(headers)),
            Box::new(EnqueueStep::new(queue)),
        ])
    }

    /// Runs every step in order against a fresh context.
    pub async fn run(
        &self,
        notification: InboundNotification,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut context = ForwardContext::new(notification);
        let mut completed = false;

        for step in &self.steps {
            debug!(step = step.name(), message_id = %context.message_id(), "Running pipeline step");
            match step.run(&mut context).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Complete) => {
                    debug!(step = step.name(), "Pipeline completed early");
                    completed = true;
                    break;
                }
                Err(e) => {
                    error!(
                        step = step.name(),
                        message_id = %context.message_id(),
                        error = %e,
                        "Pipeline step failed"
                    );
                    return Err(e);
                }
            }
        }

        let message_id = context.message_id().to_string();
        if completed {
            info!(message_id = %message_id, "Process finished without forwarding");
            return Ok(PipelineOutcome::NoRecipients { message_id });
        }

        let queue_id = context
            .queue_id
            .ok_or(PipelineError::MissingContext("queue_id"))?;
        info!(
            message_id = %message_id,
            queue_id = %queue_id,
            recipients = ?context.recipients,
            "Process finished successfully"
        );
        Ok(PipelineOutcome::Queued {
            message_id,
            queue_id,
            recipients: context.recipients,
        })
    }
}
