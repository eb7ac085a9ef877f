use std::env;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tumble_utils::{
    logging::{self, LogFormat},
    Config, InboundNotification, PipelineOutcome,
};

/// Reads the notification from the file named by the first argument, or
/// from stdin when there is no argument or it is `-`.
async fn read_notification() -> Result<String> {
    match env::args().nth(1) {
        Some(path) if path != "-" => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read notification from {path}")),
        _ => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("Failed to read notification from stdin")?;
            Ok(input)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LogFormat::from_env());

    let config = Config::from_environment().context("Failed to load configuration")?;
    let pipeline = config.pipeline().context("Failed to build pipeline")?;

    let input = read_notification().await?;
    let notification = InboundNotification::from_json(&input)?;

    match pipeline.run(notification).await {
        Ok(PipelineOutcome::Queued {
            message_id,
            queue_id,
            recipients,
        }) => {
            info!(
                message_id = %message_id,
                queue_id = %queue_id,
                recipients = ?recipients,
                "Forward queued"
            );
            Ok(())
        }
        Ok(PipelineOutcome::NoRecipients { message_id }) => {
            info!(message_id = %message_id, "Nothing to forward");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Forwarding failed");
            Err(e.into())
        }
    }
}
