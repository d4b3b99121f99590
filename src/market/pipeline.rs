use crate::market::client::SyncClient;
use crate::market::types::SeriesKey;
use crate::transport::PushEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Host requests delivered to a running chart sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    SwitchSeries(SeriesKey),
    Refresh { force_full_reload: bool },
    SetVisible(bool),
    SetRefreshInterval(u64),
    SetAutoRefresh(bool),
}

/// Drives one client until cancellation or a terminal render failure, then
/// tears it down.
pub async fn run_chart_sync(
    mut client: SyncClient,
    mut push_events: mpsc::Receiver<PushEvent>,
    mut commands: mpsc::Receiver<SyncCommand>,
    cancel_token: CancellationToken,
) {
    client.start().await;

    let mut push_open = true;
    let mut commands_open = true;
    while !client.is_terminal() {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            command = commands.recv(), if commands_open => match command {
                Some(command) => {
                    debug!(?command, "chart sync command");
                    client.handle_command(command).await;
                }
                None => commands_open = false,
            },
            event = push_events.recv(), if push_open => match event {
                Some(event) => client.handle_push_event(event).await,
                None => {
                    push_open = false;
                    client
                        .handle_push_event(PushEvent::Disconnected {
                            reason: "push channel task ended".to_string(),
                        })
                        .await;
                }
            },
            wakeup = client.next_wakeup() => {
                client.on_wakeup(wakeup).await;
            }
        }
    }

    client.destroy().await;
    info!(symbol = %client.key().symbol, phase = ?client.phase(), "chart sync loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::client::SyncClientDeps;
    use crate::market::testing::{candle_json, records, FakeChartBackend, FakePollSource, FakePushControl};
    use crate::market::types::{StartChartSyncArgs, SyncPhase, SyncStatusSnapshot, Timeframe};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    struct Running {
        push: Arc<FakePushControl>,
        poll: Arc<FakePollSource>,
        chart: FakeChartBackend,
        status: Arc<RwLock<SyncStatusSnapshot>>,
        push_tx: mpsc::Sender<PushEvent>,
        commands_tx: mpsc::Sender<SyncCommand>,
        cancel_token: CancellationToken,
        join_handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_loop() -> Running {
        let config = StartChartSyncArgs::default()
            .normalize()
            .expect("defaults should be valid");
        let push = Arc::new(FakePushControl::default());
        let poll = Arc::new(FakePollSource::new(|key, _| {
            let close = if key.symbol == "BTCUSDT" { 50_000.0 } else { 3_000.0 };
            records(&format!("[{}]", candle_json(1_700_000_000, close)))
        }));
        let chart = FakeChartBackend::default();
        let status = Arc::new(RwLock::new(SyncStatusSnapshot::stopped(
            config.key.symbol.clone(),
            None,
        )));
        let client = SyncClient::new(
            &config,
            SyncClientDeps {
                push: push.clone(),
                poll: poll.clone(),
                chart: Box::new(chart.clone()),
            },
            status.clone(),
        )
        .expect("client should build");

        let (push_tx, push_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_chart_sync(
            client,
            push_rx,
            commands_rx,
            cancel_token.clone(),
        ));

        Running {
            push,
            poll,
            chart,
            status,
            push_tx,
            commands_tx,
            cancel_token,
            join_handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_tears_session_down() {
        let running = spawn_loop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.status.read().await.candle_count, 1);

        running.cancel_token.cancel();
        running.join_handle.await.expect("loop should finish");

        let status = running.status.read().await.clone();
        assert_eq!(status.phase, SyncPhase::Stopped);
        assert_eq!(running.push.unsubscribe_count(), 1);
        assert_eq!(running.chart.log().charts_removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_switch_series_and_polling_continues() {
        let running = spawn_loop();
        let eth = SeriesKey::new("ETHUSDT", Timeframe::M1).expect("valid key");

        running
            .commands_tx
            .send(SyncCommand::SwitchSeries(eth))
            .await
            .expect("loop should accept commands");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = running.status.read().await.clone();
        assert_eq!(status.symbol, "ETHUSDT");
        assert_eq!(status.last_known_price, Some(3_000.0));

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let calls = running.poll.calls();
        assert_eq!(calls.last().map(|(key, limit)| (key.symbol.as_str(), *limit)), Some(("ETHUSDT", 2)));

        running.cancel_token.cancel();
        running.join_handle.await.expect("loop should finish");
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_drive_live_phase() {
        let running = spawn_loop();

        running
            .push_tx
            .send(PushEvent::Connected)
            .await
            .expect("loop should accept events");
        running
            .push_tx
            .send(PushEvent::Candle {
                topic: "/topic/kline/BTCUSDT/1m".to_string(),
                payload: candle_json(1_700_000_060, 51_000.0).into_bytes(),
            })
            .await
            .expect("loop should accept events");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(running.status.read().await.phase, SyncPhase::Live);

        drop(running.push_tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.status.read().await.phase, SyncPhase::Degraded);

        running.cancel_token.cancel();
        running.join_handle.await.expect("loop should finish");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_render_failure_ends_loop() {
        let running = spawn_loop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        running.chart.detach();
        running
            .commands_tx
            .send(SyncCommand::Refresh {
                force_full_reload: true,
            })
            .await
            .expect("loop should accept commands");

        running.join_handle.await.expect("loop should finish on its own");
        assert_eq!(running.status.read().await.phase, SyncPhase::Terminal);
    }
}
