//! `homelink poll`: plain-HTTP refresh loop for when realtime is not wanted.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cli::{GlobalOpts, OutputFormat, PollArgs};
use crate::config::Session;
use crate::error::CliError;
use crate::output::{self, Painter};

use super::metrics;
use super::util;

pub async fn handle(session: &Session, args: &PollArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let secs = args.interval.unwrap_or(session.config.refresh_interval);
    if secs == 0 {
        return Err(CliError::Validation {
            field: "interval".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    let client = session.client()?;
    let painter = Painter::new(global.color);
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    debug!(interval_secs = secs, "polling metrics");
    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }

        match client.get_metrics().await {
            Ok(sample) => {
                util::record_metrics(&session.store, &sample);
                let line = match global.output {
                    OutputFormat::Json | OutputFormat::JsonCompact => serde_json::to_string(&sample)?,
                    OutputFormat::Plain => metrics::plain(&sample),
                    OutputFormat::Table => super::watch::metrics_line(&sample, painter),
                };
                output::print_output(&line, global.quiet);
            }
            Err(e) if e.is_auth_failure() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "metrics fetch failed");
                output::notice(&painter.bad(&format!("fetch failed: {e}")), global.quiet);
            }
        }
    }

    Ok(())
}
