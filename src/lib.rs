//! Live K-line synchronization: a STOMP push feed and an HTTP poll fallback
//! merged into one bounded candle window, rendered through a self-healing
//! chart surface.

pub mod commands;
pub mod error;
pub mod market;
pub mod state;
pub mod transport;

pub use commands::chart_sync::{
    chart_sync_running, chart_sync_status, refresh_chart, set_chart_auto_refresh,
    set_chart_refresh_interval, set_chart_visibility, start_chart_sync, start_chart_sync_with,
    stop_chart_sync, switch_chart_series,
};
pub use commands::health::health;
pub use error::SyncError;
pub use state::ChartSyncState;
