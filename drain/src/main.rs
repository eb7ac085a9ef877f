use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::{error, info};
use tumble_utils::{
    logging::{self, LogFormat},
    Config, DrainReport,
};

/// Renders a drain report as a single JSON line, the same shape is used
/// for one-shot and interval runs.
fn render_report(report: &DrainReport) -> serde_json::Result<String> {
    serde_json::to_string(report)
}

/// Reads `DRAIN_INTERVAL_SECS`, when unset a single drain is run.
fn drain_interval() -> Result<Option<Duration>> {
    match env::var("DRAIN_INTERVAL_SECS") {
        Ok(value) if !value.is_empty() => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("Invalid DRAIN_INTERVAL_SECS {value:?}"))?;
            Ok(Some(Duration::from_secs(secs.max(1))))
        }
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LogFormat::from_env());

    let config = Config::from_environment().context("Failed to load configuration")?;
    let drainer = Arc::new(config.drainer().context("Failed to build drainer")?);

    let Some(interval) = drain_interval()? else {
        let report = drainer.drain().await?;
        println!("{}", render_report(&report)?);
        return Ok(());
    };

    info!(interval_secs = interval.as_secs(), "Draining on a fixed interval");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match drainer.drain().await {
                    Ok(report) => println!("{}", render_report(&report)?),
                    Err(e) => error!(error = %e, "Drain failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down drainer");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tumble_utils::{IterationOutcome, WorkerPoolPlan, WorkerSummary};

    use super::*;

    #[test]
    fn test_render_report() {
        let report = DrainReport {
            plan: WorkerPoolPlan {
                backlog_estimate: 3,
                concurrency: 1,
            },
            workers: vec![WorkerSummary {
                worker: 0,
                iterations: vec![IterationOutcome::Empty],
                error: None,
            }],
        };
        let line = render_report(&report).unwrap();
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["plan"]["backlog_estimate"], 3);
        assert_eq!(value["plan"]["concurrency"], 1);
        assert_eq!(value["workers"][0]["worker"], 0);
        assert_eq!(value["workers"][0]["iterations"][0]["status"], "empty");
    }
}
