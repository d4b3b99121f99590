pub mod http;
pub mod stomp;
pub mod ws;

use crate::error::SyncError;
use crate::market::types::{SeriesKey, Timeframe, WireRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Body of the subscribe/unsubscribe control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub session_id: String,
}

impl SubscriptionRequest {
    pub fn new(key: &SeriesKey, session_id: &str) -> Self {
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            session_id: session_id.to_string(),
        }
    }
}

/// Control side of the push channel.
#[async_trait]
pub trait PushControl: Send + Sync {
    async fn subscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError>;
    async fn unsubscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError>;
}

/// Read side of the poll endpoint. Returns records oldest first.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_candles(&self, key: &SeriesKey, limit: u16) -> Result<Vec<WireRecord>, SyncError>;
}

/// What the push transport reports to the synchronization client.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Disconnected { reason: String },
    Reconnected,
    Candle { topic: String, payload: Vec<u8> },
    Snapshot { topic: String, payload: Vec<u8> },
}
