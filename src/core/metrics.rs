use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

pub(crate) fn record_grading_run(lane: &'static str, outcome: &'static str) {
    metrics::counter!("grading_runs_total", "lane" => lane, "outcome" => outcome).increment(1);
}

pub(crate) fn record_rate_limited() {
    metrics::counter!("grading_rate_limited_total").increment(1);
}

pub(crate) fn record_script_duration(lane: &'static str, elapsed: Duration) {
    metrics::histogram!("grading_script_duration_seconds", "lane" => lane)
        .record(elapsed.as_secs_f64());
}

pub(crate) fn record_submission(status: &'static str) {
    metrics::counter!("grader_submissions_total", "status" => status).increment(1);
}

pub(crate) fn record_service_check(kind: &'static str, reachable: bool) {
    let result = if reachable { "up" } else { "down" };
    metrics::counter!("service_checks_total", "kind" => kind, "result" => result).increment(1);
}

pub(crate) fn record_token(result: &'static str) {
    metrics::counter!("tokens_dispensed_total", "result" => result).increment(1);
}
