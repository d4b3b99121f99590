use crate::error::SyncError;
use crate::market::chart::ChannelChartBackend;
use crate::market::client::{SyncClient, SyncClientDeps};
use crate::market::pipeline::{run_chart_sync, SyncCommand};
use crate::market::types::{
    validate_refresh_interval, ChartFrame, ChartSyncConfig, ChartSyncSession, ChartSyncStopResult,
    StartChartSyncArgs, SwitchSeriesArgs, SyncPhase, SyncStatusSnapshot,
};
use crate::state::{ChartSyncHandle, ChartSyncState};
use crate::transport::http::HttpPollSource;
use crate::transport::ws::StompPushChannel;
use crate::transport::PushEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 64;

/// Starts a session against the configured market-data service, replacing
/// any running one. Chart frames for the host are sent on `frames`.
pub async fn start_chart_sync(
    state: &ChartSyncState,
    args: Option<StartChartSyncArgs>,
    frames: mpsc::UnboundedSender<ChartFrame>,
) -> Result<ChartSyncSession, SyncError> {
    let config = args.unwrap_or_default().normalize()?;
    shutdown_running(state).await;

    let cancellation_token = CancellationToken::new();
    let (push, push_events, push_handle) =
        StompPushChannel::spawn(config.ws_url.clone(), cancellation_token.clone());
    let deps = SyncClientDeps {
        push,
        poll: Arc::new(HttpPollSource::new(config.http_base_url.clone())),
        chart: Box::new(ChannelChartBackend::new(frames)),
    };

    launch(state, config, deps, push_events, cancellation_token, Some(push_handle)).await
}

/// Starts a session over caller-provided transports and chart backend.
pub async fn start_chart_sync_with(
    state: &ChartSyncState,
    config: ChartSyncConfig,
    deps: SyncClientDeps,
    push_events: mpsc::Receiver<PushEvent>,
) -> Result<ChartSyncSession, SyncError> {
    shutdown_running(state).await;
    launch(state, config, deps, push_events, CancellationToken::new(), None).await
}

async fn shutdown_running(state: &ChartSyncState) -> bool {
    let existing_handle = {
        let mut sync_slot = state.chart_sync.lock().await;
        sync_slot.take()
    };
    match existing_handle {
        Some(handle) => {
            handle.shutdown().await;
            true
        }
        None => false,
    }
}

async fn launch(
    state: &ChartSyncState,
    config: ChartSyncConfig,
    deps: SyncClientDeps,
    push_events: mpsc::Receiver<PushEvent>,
    cancellation_token: CancellationToken,
    push_handle: Option<JoinHandle<()>>,
) -> Result<ChartSyncSession, SyncError> {
    let client = match SyncClient::new(&config, deps, Arc::clone(&state.chart_status)) {
        Ok(client) => client,
        Err(error) => {
            cancellation_token.cancel();
            return Err(error);
        }
    };

    let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let join_handle = tokio::spawn(run_chart_sync(
        client,
        push_events,
        commands_rx,
        cancellation_token.clone(),
    ));

    {
        let mut sync_slot = state.chart_sync.lock().await;
        *sync_slot = Some(ChartSyncHandle {
            cancellation_token,
            join_handle,
            push_handle,
            commands,
        });
    }

    Ok(ChartSyncSession::from_config(&config))
}

pub async fn stop_chart_sync(state: &ChartSyncState) -> Result<ChartSyncStopResult, SyncError> {
    let stopped = shutdown_running(state).await;

    {
        let (current_symbol, current_timeframe) = {
            let readable = state.chart_status.read().await;
            (readable.symbol.clone(), readable.timeframe)
        };
        let mut writable = state.chart_status.write().await;
        *writable = SyncStatusSnapshot {
            timeframe: current_timeframe,
            ..SyncStatusSnapshot::stopped(
                current_symbol,
                Some("chart sync stopped by command".to_string()),
            )
        };
    }

    Ok(ChartSyncStopResult { stopped })
}

pub async fn chart_sync_status(state: &ChartSyncState) -> Result<SyncStatusSnapshot, SyncError> {
    let snapshot = state.chart_status.read().await.clone();
    Ok(snapshot)
}

async fn send_command(state: &ChartSyncState, command: SyncCommand) -> Result<(), SyncError> {
    let sender = {
        let sync_slot = state.chart_sync.lock().await;
        sync_slot.as_ref().map(|handle| handle.commands.clone())
    }
    .ok_or(SyncError::NotRunning)?;

    sender
        .send(command)
        .await
        .map_err(|_| SyncError::ChannelClosed("chart sync loop has stopped".to_string()))
}

pub async fn switch_chart_series(
    state: &ChartSyncState,
    args: SwitchSeriesArgs,
) -> Result<(), SyncError> {
    let key = args.normalize()?;
    send_command(state, SyncCommand::SwitchSeries(key)).await
}

pub async fn refresh_chart(state: &ChartSyncState, force_full_reload: bool) -> Result<(), SyncError> {
    send_command(state, SyncCommand::Refresh { force_full_reload }).await
}

pub async fn set_chart_visibility(state: &ChartSyncState, visible: bool) -> Result<(), SyncError> {
    send_command(state, SyncCommand::SetVisible(visible)).await
}

pub async fn set_chart_refresh_interval(
    state: &ChartSyncState,
    refresh_interval_ms: u64,
) -> Result<(), SyncError> {
    let refresh_interval_ms = validate_refresh_interval(refresh_interval_ms)?;
    send_command(state, SyncCommand::SetRefreshInterval(refresh_interval_ms)).await
}

pub async fn set_chart_auto_refresh(state: &ChartSyncState, enabled: bool) -> Result<(), SyncError> {
    send_command(state, SyncCommand::SetAutoRefresh(enabled)).await
}

/// True while a session exists and has not reached a terminal failure.
pub async fn chart_sync_running(state: &ChartSyncState) -> bool {
    let has_session = state.chart_sync.lock().await.is_some();
    has_session && state.chart_status.read().await.phase != SyncPhase::Terminal
}
