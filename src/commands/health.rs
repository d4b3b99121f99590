use crate::error::SyncError;
use crate::market::types::{SyncPhase, SyncStatusSnapshot};
use crate::state::ChartSyncState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub chart_sync: SyncPhase,
}

pub fn build_health_response(started_at: Instant, chart_status: &SyncStatusSnapshot) -> HealthResponse {
    let status = match chart_status.phase {
        SyncPhase::Terminal => "error",
        SyncPhase::Degraded => "degraded",
        SyncPhase::Initializing | SyncPhase::Live | SyncPhase::Stopped => "ok",
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        chart_sync: chart_status.phase,
    }
}

pub async fn health(state: &ChartSyncState) -> Result<HealthResponse, SyncError> {
    let chart_status = state.chart_status.read().await;
    Ok(build_health_response(state.started_at, &chart_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok_for_idle_state() {
        let state = ChartSyncState::new();

        let response = health(&state).await.expect("health should not fail");

        assert_eq!(response.status, "ok");
        assert_eq!(response.chart_sync, SyncPhase::Stopped);
        assert!(response.uptime_ms <= 1_000);
    }

    #[test]
    fn terminal_chart_reports_error() {
        let mut snapshot = SyncStatusSnapshot::stopped("BTCUSDT".to_string(), None);
        snapshot.phase = SyncPhase::Terminal;

        let response = build_health_response(Instant::now(), &snapshot);
        assert_eq!(response.status, "error");
    }
}
