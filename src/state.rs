use crate::market::pipeline::SyncCommand;
use crate::market::types::{SyncStatusSnapshot, DEFAULT_SYMBOL};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ChartSyncHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub push_handle: Option<JoinHandle<()>>,
    pub commands: mpsc::Sender<SyncCommand>,
}

impl ChartSyncHandle {
    /// Cancels the session and waits for its tasks to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
        if let Some(push_handle) = self.push_handle {
            let _ = push_handle.await;
        }
    }
}

/// Host-owned state: at most one running chart sync session.
pub struct ChartSyncState {
    pub started_at: Instant,
    pub chart_sync: Mutex<Option<ChartSyncHandle>>,
    pub chart_status: Arc<RwLock<SyncStatusSnapshot>>,
}

impl ChartSyncState {
    pub fn new() -> Self {
        let chart_status = SyncStatusSnapshot::stopped(
            DEFAULT_SYMBOL.to_string(),
            Some("chart sync idle".to_string()),
        );

        Self {
            started_at: Instant::now(),
            chart_sync: Mutex::new(None),
            chart_status: Arc::new(RwLock::new(chart_status)),
        }
    }
}

impl Default for ChartSyncState {
    fn default() -> Self {
        Self::new()
    }
}
