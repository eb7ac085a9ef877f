use tracing::{debug, info};

use crate::{
    pipeline::{Flow, ForwardContext, PipelineError, PipelineStep, StepFuture},
    rewriter::{rewrite, HeaderPolicy, RewriteOptions},
    TransformedMessage,
};

/// Step rewriting the headers of the fetched message for forwarding.
pub struct RewriteStep {
    policy: HeaderPolicy,
}

impl RewriteStep {
    pub fn new(policy: HeaderPolicy) -> Self {
        info!(
            from_email = policy.from_email().unwrap_or_default(),
            subject_prefix = policy.subject_prefix().unwrap_or_default(),
            "Rewrite step initialized"
        );
        Self { policy }
    }
}

impl PipelineStep for RewriteStep {
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a> {
        Box::pin(async move {
            let message_id = context.message()?.message_id.clone();
            let raw = context.raw.as_deref().ok_or(PipelineError::MissingContext("raw"))?;
            let original_recipient = context
                .original_recipient
                .clone()
                .ok_or(PipelineError::MissingContext("original_recipient"))?;
            let aliases = context.aliases();

            let rewritten = rewrite(
                raw,
                &RewriteOptions {
                    policy: &self.policy,
                    original_recipient: &original_recipient,
                    aliases: &aliases,
                },
            );
            debug!(
                message_id = %message_id,
                header_size = rewritten.header.len(),
                "Rewrote message headers"
            );

            context.transformed = Some(TransformedMessage {
                message_id,
                header: rewritten.header,
                body: rewritten.body,
                recipients: context.recipients.clone(),
                original_recipient,
            });
            Ok(Flow::Continue)
        })
    }

    fn name(&self) -> &str {
        "rewrite"
    }
}
