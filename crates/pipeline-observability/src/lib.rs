//! Process-wide logging init and structured job/command event helpers.
//!
//! Grounded in `tandem-observability`'s `ProcessKind` + `emit_event` idiom:
//! one `tracing` target (`pipeline.obs`) carrying a fixed set of correlation
//! fields, rather than ad-hoc `info!` calls scattered through the core.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Orchestrator,
    Worker,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Orchestrator => "orchestrator",
            ProcessKind::Worker => "worker",
        }
    }
}

/// Initializes the global `tracing` subscriber. `json` selects structured
/// JSON output (suited to log aggregation in production) over the default
/// human-readable formatter (suited to local development).
pub fn init_logging(process: ProcessKind, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
    }

    tracing::info!(process = process.as_str(), "logging initialized");
    Ok(())
}

/// A single structured observability event, emitted on the `pipeline.obs`
/// target so log pipelines can filter on it independent of ad-hoc messages.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub project_id: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub worker_id: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "pipeline.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            job_id = event.job_id.unwrap_or(""),
            worker_id = event.worker_id.unwrap_or(""),
            correlation_id = event.correlation_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
        ),
        Level::WARN => tracing::warn!(
            target: "pipeline.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            job_id = event.job_id.unwrap_or(""),
            worker_id = event.worker_id.unwrap_or(""),
            correlation_id = event.correlation_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
        ),
        _ => tracing::info!(
            target: "pipeline.obs",
            component = event.component,
            event = event.event,
            project_id = event.project_id.unwrap_or(""),
            job_id = event.job_id.unwrap_or(""),
            worker_id = event.worker_id.unwrap_or(""),
            correlation_id = event.correlation_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
        ),
    }
}

/// Truncate an error message to at most `len` chars, matching the worker's
/// `JOB_FAILED` publishing rule (§4.7: "truncated error message (<=200 chars)").
pub fn truncate(message: &str, len: usize) -> String {
    if message.chars().count() <= len {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(len.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_bound() {
        let long = "x".repeat(500);
        let short = truncate(&long, 200);
        assert_eq!(short.chars().count(), 200);
    }

    #[test]
    fn truncate_is_noop_under_bound() {
        assert_eq!(truncate("short", 200), "short");
    }
}
