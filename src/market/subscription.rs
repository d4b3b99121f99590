use crate::market::types::{FeedState, SeriesKey};
use crate::transport::PushControl;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub key: SeriesKey,
    pub session_id: String,
    pub state: FeedState,
    /// Whether the last subscribe request reached the transport.
    pub delivered: bool,
}

pub fn new_session_id() -> String {
    format!("kline_{}", Uuid::new_v4().simple())
}

/// Tracks the single push subscription of a client.
pub struct SubscriptionLifecycle {
    push: Arc<dyn PushControl>,
    current: Option<Subscription>,
}

impl SubscriptionLifecycle {
    pub fn new(push: Arc<dyn PushControl>) -> Self {
        Self {
            push,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Subscription> {
        self.current.as_ref()
    }

    pub fn state(&self) -> FeedState {
        self.current
            .as_ref()
            .map(|subscription| subscription.state)
            .unwrap_or(FeedState::Unsubscribed)
    }

    /// Issues a subscribe for `key` with a fresh session id. The subscription
    /// is `Pending` even if the request could not be sent; it is re-issued on
    /// the next connect.
    pub async fn subscribe(&mut self, key: SeriesKey) {
        let session_id = new_session_id();
        let delivered = match self.push.subscribe(&key, &session_id).await {
            Ok(()) => {
                info!(symbol = %key.symbol, timeframe = %key.timeframe, %session_id, "kline subscribe sent");
                true
            }
            Err(error) => {
                warn!(
                    symbol = %key.symbol,
                    timeframe = %key.timeframe,
                    %session_id,
                    %error,
                    "kline subscribe failed; will retry on connect"
                );
                false
            }
        };

        self.current = Some(Subscription {
            key,
            session_id,
            state: FeedState::Pending,
            delivered,
        });
    }

    /// Best-effort unsubscribe. The subscription is dropped whatever the outcome.
    pub async fn unsubscribe(&mut self) {
        let Some(subscription) = self.current.take() else {
            return;
        };
        if !subscription.delivered {
            return;
        }

        if let Err(error) = self
            .push
            .unsubscribe(&subscription.key, &subscription.session_id)
            .await
        {
            warn!(
                symbol = %subscription.key.symbol,
                timeframe = %subscription.key.timeframe,
                session_id = %subscription.session_id,
                %error,
                "kline unsubscribe failed"
            );
        }
    }

    pub async fn switch(&mut self, key: SeriesKey) {
        self.unsubscribe().await;
        self.subscribe(key).await;
    }

    /// First connect: sends any subscribe that could not be delivered yet.
    pub async fn on_connected(&mut self) {
        let pending = self
            .current
            .as_ref()
            .filter(|subscription| !subscription.delivered)
            .map(|subscription| subscription.key.clone());
        if let Some(key) = pending {
            self.subscribe(key).await;
        }
    }

    pub fn on_disconnected(&mut self) {
        if let Some(subscription) = self.current.as_mut() {
            subscription.delivered = false;
        }
    }

    /// The transport re-established the channel; server-side subscriptions
    /// are gone, so any live subscription is issued again under a new id.
    pub async fn on_reconnected(&mut self) {
        let Some(subscription) = self.current.take() else {
            return;
        };
        debug!(
            symbol = %subscription.key.symbol,
            old_session_id = %subscription.session_id,
            "re-issuing kline subscription after reconnect"
        );
        self.subscribe(subscription.key).await;
    }

    /// Marks the subscription active on the first message for its topics.
    /// Returns true on the `Pending -> Active` transition.
    pub fn on_message(&mut self, topic: &str) -> bool {
        let Some(subscription) = self.current.as_mut() else {
            return false;
        };
        let for_key =
            topic == subscription.key.topic() || topic == subscription.key.initial_topic();
        if for_key && subscription.state == FeedState::Pending {
            subscription.state = FeedState::Active;
            info!(
                symbol = %subscription.key.symbol,
                timeframe = %subscription.key.timeframe,
                session_id = %subscription.session_id,
                "kline feed active"
            );
            return true;
        }
        false
    }
}
