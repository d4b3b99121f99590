use crate::error::SyncError;
use crate::market::types::{now_unix_ms, SeriesKey};
use crate::market::{INITIAL_TOPIC_SUFFIX, SUBSCRIBE_DESTINATION, UNSUBSCRIBE_DESTINATION};
use crate::transport::stomp::{decode_frames, StompCommand, StompFrame};
use crate::transport::{PushControl, PushEvent, SubscriptionRequest};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type KlineWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PUSH_EVENT_BUFFER: usize = 1_024;

async fn connect_kline_stream(url: &str) -> Result<KlineWsStream, SyncError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

/// Value for the STOMP `host` header: the authority part of the url.
fn stomp_host(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme)
}

fn route_message(frame: StompFrame) -> Option<PushEvent> {
    let topic = frame.get_header("destination")?.to_string();
    let payload = frame.body.into_bytes();
    if topic.ends_with(INITIAL_TOPIC_SUFFIX) {
        Some(PushEvent::Snapshot { topic, payload })
    } else {
        Some(PushEvent::Candle { topic, payload })
    }
}

/// STOMP-over-websocket push channel. Control calls are queued to the
/// connection task while a STOMP session is established and fail otherwise.
#[derive(Default)]
pub struct StompPushChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stomp_ids: Mutex<HashMap<String, Vec<String>>>,
    next_stomp_id: AtomicU64,
}

impl StompPushChannel {
    /// Starts the connection task. Events stop once `cancel_token` fires.
    pub fn spawn(
        url: String,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<PushEvent>, JoinHandle<()>) {
        let channel = Arc::new(Self::default());
        let (events_tx, events_rx) = mpsc::channel(PUSH_EVENT_BUFFER);
        let task_channel = channel.clone();
        let join_handle = tokio::spawn(async move {
            task_channel.run(url, events_tx, cancel_token).await;
        });
        (channel, events_rx, join_handle)
    }

    fn enqueue(&self, frame: StompFrame) -> Result<(), SyncError> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| SyncError::ChannelClosed("stomp session not established".to_string()))?;
        sender
            .send(frame.encode())
            .map_err(|_| SyncError::ChannelClosed("stomp connection task stopped".to_string()))
    }

    fn attach(&self, sender: mpsc::UnboundedSender<String>) {
        self.stomp_ids.lock().clear();
        *self.outbound.lock() = Some(sender);
    }

    fn detach(&self) {
        *self.outbound.lock() = None;
        self.stomp_ids.lock().clear();
    }

    async fn run(
        self: Arc<Self>,
        url: String,
        events: mpsc::Sender<PushEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut reconnect_attempt = 0_u32;
        let mut established_once = false;

        while !cancel_token.is_cancelled() {
            match connect_kline_stream(&url).await {
                Ok(stream) => {
                    let reason = self
                        .drive_connection(
                            stream,
                            &url,
                            &events,
                            &cancel_token,
                            &mut established_once,
                            &mut reconnect_attempt,
                        )
                        .await;
                    self.detach();
                    if cancel_token.is_cancelled() || events.is_closed() {
                        break;
                    }
                    warn!(%url, %reason, "kline push channel disconnected");
                    if events
                        .send(PushEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) => {
                    warn!(%url, attempt = reconnect_attempt, %error, "kline push channel connect failed");
                }
            }

            reconnect_attempt = reconnect_attempt.saturating_add(1);
            let delay = reconnect_delay(reconnect_attempt);
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.detach();
        debug!(%url, "kline push channel task stopped");
    }

    /// Runs one websocket connection until it drops. Returns the reason.
    async fn drive_connection(
        &self,
        stream: KlineWsStream,
        url: &str,
        events: &mpsc::Sender<PushEvent>,
        cancel_token: &CancellationToken,
        established_once: &mut bool,
        reconnect_attempt: &mut u32,
    ) -> String {
        let (mut sink, mut source) = stream.split();
        if let Err(error) = sink
            .send(Message::Text(StompFrame::connect(stomp_host(url)).encode()))
            .await
        {
            return format!("failed to send CONNECT: {error}");
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    let _ = sink
                        .send(Message::Text(StompFrame::new(StompCommand::Disconnect).encode()))
                        .await;
                    let _ = sink.close().await;
                    return "cancelled".to_string();
                }
                Some(text) = outbound_rx.recv() => {
                    if let Err(error) = sink.send(Message::Text(text)).await {
                        return format!("websocket send error: {error}");
                    }
                }
                next_message = source.next() => {
                    let text = match next_message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("dropping non utf-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => return "websocket closed".to_string(),
                        Some(Ok(_)) => continue,
                        Some(Err(error)) => return format!("websocket frame error: {error}"),
                    };

                    let frames = match decode_frames(&text) {
                        Ok(frames) => frames,
                        Err(error) => {
                            warn!(%error, "dropping undecodable stomp frame");
                            continue;
                        }
                    };

                    for frame in frames {
                        let event = match frame.command {
                            StompCommand::Connected => {
                                self.attach(outbound_tx.clone());
                                *reconnect_attempt = 0;
                                info!(%url, "kline push channel connected");
                                if *established_once {
                                    PushEvent::Reconnected
                                } else {
                                    *established_once = true;
                                    PushEvent::Connected
                                }
                            }
                            StompCommand::Message => match route_message(frame) {
                                Some(event) => event,
                                None => continue,
                            },
                            StompCommand::Error => {
                                let message = frame
                                    .get_header("message")
                                    .unwrap_or("unspecified")
                                    .to_string();
                                return format!("stomp error frame: {message}");
                            }
                            _ => continue,
                        };
                        if events.send(event).await.is_err() {
                            return "event receiver dropped".to_string();
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PushControl for StompPushChannel {
    async fn subscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError> {
        let body = simd_json::serde::to_string(&SubscriptionRequest::new(key, session_id))?;
        let mut ids = Vec::with_capacity(2);
        for topic in [key.topic(), key.initial_topic()] {
            let id = format!("sub-{}", self.next_stomp_id.fetch_add(1, Ordering::Relaxed));
            self.enqueue(StompFrame::subscribe(&id, &topic))?;
            ids.push(id);
        }
        self.stomp_ids.lock().insert(session_id.to_string(), ids);
        self.enqueue(StompFrame::send_json(SUBSCRIBE_DESTINATION, body))
    }

    async fn unsubscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError> {
        let ids = self.stomp_ids.lock().remove(session_id).unwrap_or_default();
        for id in ids {
            self.enqueue(StompFrame::unsubscribe(&id))?;
        }
        let body = simd_json::serde::to_string(&SubscriptionRequest::new(key, session_id))?;
        self.enqueue(StompFrame::send_json(UNSUBSCRIBE_DESTINATION, body))
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Timeframe;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", Timeframe::M1).expect("valid key")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<StompFrame> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.extend(decode_frames(&text).expect("queued frame should decode"));
        }
        frames
    }

    #[test]
    fn extracts_stomp_host_from_url() {
        assert_eq!(stomp_host("ws://localhost:8080/ws/websocket"), "localhost:8080");
        assert_eq!(stomp_host("wss://md.example.org?x=1"), "md.example.org");
    }

    #[test]
    fn routes_initial_topic_to_snapshot() {
        let frame = StompFrame::new(StompCommand::Message)
            .header("destination", "/topic/kline/BTCUSDT/1m/initial")
            .with_body("[]".to_string());
        assert!(matches!(route_message(frame), Some(PushEvent::Snapshot { .. })));

        let frame = StompFrame::new(StompCommand::Message)
            .header("destination", "/topic/kline/BTCUSDT/1m")
            .with_body("{}".to_string());
        assert!(matches!(
            route_message(frame),
            Some(PushEvent::Candle { topic, .. }) if topic == "/topic/kline/BTCUSDT/1m"
        ));

        assert!(route_message(StompFrame::new(StompCommand::Message)).is_none());
    }

    #[tokio::test]
    async fn control_calls_fail_without_session() {
        let channel = StompPushChannel::default();
        let result = channel.subscribe(&key(), "kline_a").await;
        assert!(matches!(result, Err(SyncError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_queue_frames() {
        let channel = StompPushChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        channel
            .subscribe(&key(), "kline_a")
            .await
            .expect("subscribe should queue");
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].get_header("destination"), Some("/topic/kline/BTCUSDT/1m"));
        assert_eq!(
            frames[1].get_header("destination"),
            Some("/topic/kline/BTCUSDT/1m/initial")
        );
        assert_eq!(frames[2].get_header("destination"), Some(SUBSCRIBE_DESTINATION));
        assert_eq!(
            frames[2].body,
            r#"{"symbol":"BTCUSDT","timeframe":"1m","sessionId":"kline_a"}"#
        );

        channel
            .unsubscribe(&key(), "kline_a")
            .await
            .expect("unsubscribe should queue");
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command, StompCommand::Unsubscribe);
        assert_eq!(frames[0].get_header("id"), Some("sub-0"));
        assert_eq!(frames[1].get_header("id"), Some("sub-1"));
        assert_eq!(frames[2].get_header("destination"), Some(UNSUBSCRIBE_DESTINATION));
    }

    #[test]
    fn reconnect_delay_is_capped() {
        assert!(reconnect_delay(1) >= Duration::from_millis(400));
        assert!(reconnect_delay(30) <= Duration::from_millis(5_000));
    }
}
