use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    alias::{resolve_recipient, AliasDirectory, SuppressionPolicy},
    pipeline::{Flow, ForwardContext, PipelineStep, StepFuture},
    ResolvedRecipient,
};

/// Step resolving every original recipient through the alias directory.
///
/// All lookups run concurrently. When no recipient is left the run ends
/// successfully without forwarding anything.
pub struct ResolveStep {
    directory: Arc<dyn AliasDirectory>,
    policy: SuppressionPolicy,
}

impl ResolveStep {
    pub fn new(directory: Arc<dyn AliasDirectory>, policy: SuppressionPolicy) -> Self {
        info!(
            directory = directory.name(),
            max_bounces = policy.max_bounces,
            "Resolve step initialized"
        );
        Self { directory, policy }
    }
}

impl PipelineStep for ResolveStep {
    fn run<'a>(&'a self, context: &'a mut ForwardContext) -> StepFuture<'a> {
        Box::pin(async move {
            let originals = context.message()?.original_recipients.clone();

            let lookups = originals
                .iter()
                .map(|address| resolve_recipient(self.directory.as_ref(), &self.policy, address));
            let resolved = join_all(lookups).await;
            context.resolutions = originals.into_iter().zip(resolved).collect();

            let mut recipients: Vec<String> = Vec::new();
            for (alias, resolved) in &context.resolutions {
                let Some(target) = resolved.target() else {
                    continue;
                };
                if context.original_recipient.is_none() {
                    context.original_recipient = Some(alias.clone());
                }
                if !recipients.iter().any(|r| r.eq_ignore_ascii_case(target)) {
                    recipients.push(target.to_string());
                }
            }

            let suppressed = context
                .resolutions
                .iter()
                .filter(|(_, resolved)| *resolved == ResolvedRecipient::Suppressed)
                .count();

            if recipients.is_empty() {
                warn!(
                    message_id = %context.message_id(),
                    suppressed = suppressed,
                    "Finishing process, no valid recipients found"
                );
                return Ok(Flow::Complete);
            }

            info!(
                message_id = %context.message_id(),
                recipients = ?recipients,
                suppressed = suppressed,
                "Resolved forward recipients"
            );
            context.recipients = recipients;
            Ok(Flow::Continue)
        })
    }

    fn name(&self) -> &str {
        "resolve"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alias::{tests::RecordingDirectory, AliasRecord},
        InboundNotification,
    };

    fn context(recipients: &[&str]) -> ForwardContext {
        let notification = InboundNotification::for_message("abc", recipients);
        let mut context = ForwardContext::new(notification);
        context.message = Some(context.notification.validate().unwrap());
        context
    }

    #[tokio::test]
    async fn test_resolve_filters_suppressed_targets() {
        let directory = Arc::new(
            RecordingDirectory::new(&[
                ("info@example.com", AliasRecord::new("team@example.com")),
                (
                    "bounce@example.com",
                    AliasRecord {
                        count_bounce: 4,
                        ..AliasRecord::new("bouncy@example.com")
                    },
                ),
                (
                    "complaint@example.com",
                    AliasRecord {
                        count_complaint: 1,
                        ..AliasRecord::new("angry@example.com")
                    },
                ),
                (
                    "optout@example.com",
                    AliasRecord {
                        optout: true,
                        ..AliasRecord::new("gone@example.com")
                    },
                ),
            ])
            .failing_on("broken@example.com"),
        );
        let step = ResolveStep::new(directory.clone(), SuppressionPolicy::default());
        let mut context = context(&[
            "bounce@example.com",
            "Info@Example.com",
            "complaint@example.com",
            "optout@example.com",
            "broken@example.com",
            "unknown@example.com",
        ]);

        let flow = step.run(&mut context).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(context.recipients, vec!["team@example.com"]);
        assert_eq!(context.original_recipient.as_deref(), Some("Info@Example.com"));
        assert_eq!(context.resolutions.len(), 6);
        assert_eq!(context.resolutions[0].0, "bounce@example.com");
        assert_eq!(directory.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_resolve_deduplicates_targets() {
        let directory = Arc::new(RecordingDirectory::new(&[
            ("a@example.com", AliasRecord::new("team@example.com")),
            ("b@example.com", AliasRecord::new("TEAM@example.com")),
            ("c@example.com", AliasRecord::new("ops@example.com")),
        ]));
        let step = ResolveStep::new(directory, SuppressionPolicy::default());
        let mut context = context(&["a@example.com", "b@example.com", "c@example.com"]);

        step.run(&mut context).await.unwrap();
        assert_eq!(context.recipients, vec!["team@example.com", "ops@example.com"]);
        assert_eq!(context.original_recipient.as_deref(), Some("a@example.com"));
    }

    #[tokio::test]
    async fn test_resolve_without_targets_completes() {
        let directory = Arc::new(RecordingDirectory::new(&[]).failing_on("info@example.com"));
        let step = ResolveStep::new(directory, SuppressionPolicy::default());
        let mut context = context(&["info@example.com", "other@example.com"]);

        let flow = step.run(&mut context).await.unwrap();
        assert_eq!(flow, Flow::Complete);
        assert!(context.recipients.is_empty());
        assert!(context.original_recipient.is_none());
    }

    #[tokio::test]
    async fn test_resolve_respects_configured_threshold() {
        let directory = Arc::new(RecordingDirectory::new(&[(
            "info@example.com",
            AliasRecord {
                count_bounce: 2,
                ..AliasRecord::new("team@example.com")
            },
        )]));
        let step = ResolveStep::new(directory, SuppressionPolicy { max_bounces: 1 });
        let mut context = context(&["info@example.com"]);
        assert_eq!(step.run(&mut context).await.unwrap(), Flow::Complete);
    }
}
