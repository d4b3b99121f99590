pub mod chart_sync;
pub mod health;
