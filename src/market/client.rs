use crate::error::SyncError;
use crate::market::pipeline::SyncCommand;
use crate::market::render::{ChartBackend, RenderHealthMonitor, RenderOutcome};
use crate::market::scheduler::{
    FinishOutcome, PollScheduler, RefreshMode, RefreshOutcome, RefreshPolicy, RefreshTrigger,
    SchedulerEvent,
};
use crate::market::series::SeriesState;
use crate::market::subscription::SubscriptionLifecycle;
use crate::market::types::{
    parse_candle_batch_payload, parse_candle_payload, ChartSyncConfig, FeedState, SeriesKey,
    SyncPhase, SyncStatusSnapshot, WireRecord,
};
use crate::market::validator::{validate_batch, validate_candle};
use crate::transport::{PollSource, PushControl, PushEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators of a [`SyncClient`].
pub struct SyncClientDeps {
    pub push: Arc<dyn PushControl>,
    pub poll: Arc<dyn PollSource>,
    pub chart: Box<dyn ChartBackend>,
}

#[derive(Debug)]
pub struct PollCompletion {
    pub seq: u64,
    pub key: SeriesKey,
    pub mode: RefreshMode,
    pub result: Result<Vec<WireRecord>, SyncError>,
}

#[derive(Debug)]
pub enum Wakeup {
    Scheduler(SchedulerEvent),
    PollCompleted(PollCompletion),
}

/// Owns one active series key and merges push and poll updates into a single
/// bounded candle window rendered through the health monitor.
pub struct SyncClient {
    key: SeriesKey,
    max_candles: usize,
    series: SeriesState,
    subscription: SubscriptionLifecycle,
    scheduler: PollScheduler,
    render: RenderHealthMonitor,
    poll: Arc<dyn PollSource>,
    completions_tx: mpsc::UnboundedSender<PollCompletion>,
    completions_rx: mpsc::UnboundedReceiver<PollCompletion>,
    fetch_task: Option<JoinHandle<()>>,
    push_connected: bool,
    received_data: bool,
    phase: SyncPhase,
    reason: Option<String>,
    status: Arc<RwLock<SyncStatusSnapshot>>,
    destroyed: bool,
}

impl SyncClient {
    pub fn new(
        config: &ChartSyncConfig,
        deps: SyncClientDeps,
        status: Arc<RwLock<SyncStatusSnapshot>>,
    ) -> Result<Self, SyncError> {
        let policy = RefreshPolicy::new(config.refresh_interval_ms, config.auto_refresh)?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            key: config.key.clone(),
            max_candles: config.max_candles,
            series: SeriesState::new(config.max_candles),
            subscription: SubscriptionLifecycle::new(deps.push),
            scheduler: PollScheduler::new(policy),
            render: RenderHealthMonitor::new(deps.chart, config.chart),
            poll: deps.poll,
            completions_tx,
            completions_rx,
            fetch_task: None,
            push_connected: false,
            received_data: false,
            phase: SyncPhase::Initializing,
            reason: None,
            status,
            destroyed: false,
        })
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn series(&self) -> &SeriesState {
        &self.series
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn feed_state(&self) -> FeedState {
        self.subscription.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == SyncPhase::Terminal
    }

    pub async fn start(&mut self) {
        info!(symbol = %self.key.symbol, timeframe = %self.key.timeframe, "chart sync starting");
        if let RenderOutcome::Terminal(reason) = self.render.mount(self.series.snapshot()) {
            self.enter_terminal(reason);
            self.publish_status().await;
            return;
        }

        self.scheduler.start();
        self.subscription.subscribe(self.key.clone()).await;
        self.refresh(RefreshMode::FullReload, RefreshTrigger::Host);
        self.publish_status().await;
    }

    /// Waits for the scheduler or a finished poll. Cancel safe.
    pub async fn next_wakeup(&mut self) -> Wakeup {
        tokio::select! {
            event = self.scheduler.next_event() => Wakeup::Scheduler(event),
            Some(completion) = self.completions_rx.recv() => Wakeup::PollCompleted(completion),
        }
    }

    pub async fn on_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Scheduler(SchedulerEvent::Tick) => {
                self.refresh(RefreshMode::Incremental, RefreshTrigger::Timer);
            }
            Wakeup::Scheduler(SchedulerEvent::Resume) => {
                self.scheduler.on_resume();
                self.refresh(RefreshMode::Incremental, RefreshTrigger::Timer);
            }
            Wakeup::PollCompleted(completion) => self.on_poll_completed(completion),
        }
        self.publish_status().await;
    }

    pub async fn handle_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                self.push_connected = true;
                self.subscription.on_connected().await;
            }
            PushEvent::Disconnected { reason } => {
                self.push_connected = false;
                self.subscription.on_disconnected();
                self.reason = Some(format!("push channel disconnected: {reason}"));
            }
            PushEvent::Reconnected => {
                self.push_connected = true;
                self.subscription.on_reconnected().await;
            }
            PushEvent::Candle { topic, mut payload } => self.on_push_candle(&topic, &mut payload),
            PushEvent::Snapshot { topic, mut payload } => self.on_push_snapshot(&topic, &mut payload),
        }
        self.recompute_phase();
        self.publish_status().await;
    }

    pub async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::SwitchSeries(key) => self.switch_key(key).await,
            SyncCommand::Refresh { force_full_reload } => {
                let mode = if force_full_reload {
                    RefreshMode::FullReload
                } else {
                    RefreshMode::Incremental
                };
                self.refresh(mode, RefreshTrigger::Host);
            }
            SyncCommand::SetVisible(visible) => self.set_visible(visible),
            SyncCommand::SetRefreshInterval(interval_ms) => {
                if let Err(error) = self.set_refresh_interval(interval_ms) {
                    warn!(interval_ms, %error, "refresh interval change rejected");
                }
            }
            SyncCommand::SetAutoRefresh(enabled) => self.set_auto_refresh(enabled),
        }
        self.publish_status().await;
    }

    /// Starts a refresh unless one is already running. Never fails; the
    /// outcome of the fetch arrives later as a [`Wakeup::PollCompleted`].
    pub fn refresh(&mut self, mode: RefreshMode, trigger: RefreshTrigger) -> RefreshOutcome {
        let outcome = self.scheduler.begin_refresh(mode, trigger);
        if let RefreshOutcome::Started { seq, mode } = outcome {
            let poll = self.poll.clone();
            let key = self.key.clone();
            let limit = mode.fetch_limit(self.max_candles);
            let completions = self.completions_tx.clone();
            debug!(symbol = %key.symbol, timeframe = %key.timeframe, seq, ?mode, limit, "poll refresh started");
            self.abort_fetch();
            self.fetch_task = Some(tokio::spawn(async move {
                let result = poll.fetch_candles(&key, limit).await;
                let _ = completions.send(PollCompletion {
                    seq,
                    key,
                    mode,
                    result,
                });
            }));
        }
        outcome
    }

    pub async fn switch_key(&mut self, key: SeriesKey) {
        if key == self.key {
            self.refresh(RefreshMode::FullReload, RefreshTrigger::Host);
            return;
        }
        info!(from = %self.key, to = %key, "switching chart series");

        self.key = key.clone();
        self.series.clear();
        self.received_data = false;
        self.scheduler.abandon_in_flight();
        self.abort_fetch();
        let outcome = self.render.apply_full_replace(self.series.snapshot());
        self.on_render_outcome(outcome);

        self.subscription.switch(key).await;
        self.refresh(RefreshMode::FullReload, RefreshTrigger::Host);
        self.recompute_phase();
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.scheduler.set_visible(visible) {
            debug!("chart surface visible again; reloading");
            self.refresh(RefreshMode::FullReload, RefreshTrigger::Host);
        }
    }

    pub fn set_refresh_interval(&mut self, interval_ms: u64) -> Result<(), SyncError> {
        self.scheduler.set_interval_ms(interval_ms)?;
        info!(interval_ms, "refresh interval updated");
        Ok(())
    }

    pub fn set_auto_refresh(&mut self, enabled: bool) {
        self.scheduler.set_enabled(enabled);
        info!(enabled, "auto refresh toggled");
    }

    /// Stops polling, aborts the in-flight fetch, drops the subscription and
    /// removes the chart. Repeated calls do nothing.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.scheduler.stop();
        self.abort_fetch();
        self.subscription.unsubscribe().await;
        self.render.remove();

        if self.phase != SyncPhase::Terminal {
            self.phase = SyncPhase::Stopped;
            self.reason = Some("chart sync stopped".to_string());
        }
        self.push_connected = false;
        info!(symbol = %self.key.symbol, phase = ?self.phase, "chart sync destroyed");
        self.publish_status().await;
    }

    fn abort_fetch(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
    }

    fn on_poll_completed(&mut self, completion: PollCompletion) {
        if completion.key != self.key {
            debug!(stale = %completion.key, active = %self.key, "discarding poll result for previous series");
            return;
        }

        match completion.result {
            Ok(records) => {
                if self.scheduler.finish_refresh(completion.seq, true) == FinishOutcome::Ignored {
                    return;
                }
                match completion.mode {
                    RefreshMode::FullReload => self.apply_full_window(&records),
                    RefreshMode::Incremental => self.apply_incremental(&records),
                }
            }
            Err(error) => match self.scheduler.finish_refresh(completion.seq, false) {
                FinishOutcome::Ignored => {}
                FinishOutcome::BackoffStarted => {
                    self.reason = Some(format!("polling paused after repeated failures: {error}"));
                }
                outcome => {
                    warn!(symbol = %self.key.symbol, %error, ?outcome, "poll refresh failed");
                }
            },
        }
        self.recompute_phase();
    }

    fn apply_full_window(&mut self, records: &[WireRecord]) {
        let candles = validate_batch(records, &self.key, &mut self.series);
        if candles.is_empty() {
            debug!(symbol = %self.key.symbol, "full reload returned no usable candles; window kept");
            return;
        }
        self.received_data = true;
        self.series.replace_all(candles);
        let outcome = self.render.apply_full_replace(self.series.snapshot());
        self.on_render_outcome(outcome);
    }

    fn apply_incremental(&mut self, records: &[WireRecord]) {
        let candles = validate_batch(records, &self.key, &mut self.series);
        for candle in candles {
            self.received_data = true;
            self.series.upsert(candle.clone());
            let outcome = self.render.apply_update(&candle, self.series.snapshot());
            self.on_render_outcome(outcome);
            if self.is_terminal() {
                return;
            }
        }
    }

    fn on_push_candle(&mut self, topic: &str, payload: &mut [u8]) {
        let raw = match parse_candle_payload(payload) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(%topic, %error, "dropping undecodable push candle");
                return;
            }
        };
        if !self
            .key
            .accepts(raw.symbol.as_deref(), raw.timeframe.as_deref(), topic)
        {
            debug!(%topic, active = %self.key, "discarding push candle for another series");
            return;
        }

        self.subscription.on_message(topic);
        match validate_candle(&raw, &self.key, &mut self.series) {
            Ok(candle) => {
                self.received_data = true;
                self.series.upsert(candle.clone());
                let outcome = self.render.apply_update(&candle, self.series.snapshot());
                self.on_render_outcome(outcome);
            }
            Err(reason) => {
                warn!(%topic, %reason, "push candle rejected");
            }
        }
    }

    fn on_push_snapshot(&mut self, topic: &str, payload: &mut [u8]) {
        if topic != self.key.initial_topic() {
            debug!(%topic, active = %self.key, "discarding snapshot for another series");
            return;
        }
        let records = match parse_candle_batch_payload(payload) {
            Ok(records) => records,
            Err(error) => {
                warn!(%topic, %error, "dropping undecodable snapshot");
                return;
            }
        };

        self.subscription.on_message(topic);
        self.apply_full_window(&records);
    }

    fn on_render_outcome(&mut self, outcome: RenderOutcome) {
        match outcome {
            RenderOutcome::Applied => {}
            RenderOutcome::Rebuilt => {
                info!(symbol = %self.key.symbol, "chart rebuilt from current window");
            }
            RenderOutcome::Terminal(reason) => self.enter_terminal(reason),
        }
    }

    fn enter_terminal(&mut self, reason: String) {
        if self.phase == SyncPhase::Terminal {
            return;
        }
        error!(symbol = %self.key.symbol, %reason, "chart sync entered terminal state");
        self.scheduler.stop();
        self.phase = SyncPhase::Terminal;
        self.reason = Some(reason);
    }

    fn recompute_phase(&mut self) {
        if matches!(self.phase, SyncPhase::Terminal | SyncPhase::Stopped) {
            return;
        }
        self.phase = if self.push_connected && self.subscription.state() == FeedState::Active {
            self.reason = None;
            SyncPhase::Live
        } else if self.received_data {
            SyncPhase::Degraded
        } else {
            SyncPhase::Initializing
        };
    }

    pub fn status_snapshot(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            phase: self.phase,
            symbol: self.key.symbol.clone(),
            timeframe: self.key.timeframe,
            feed_state: self.subscription.state(),
            push_connected: self.push_connected,
            polling: self.scheduler.is_ticking() || self.scheduler.in_backoff(),
            visible: self.scheduler.is_visible(),
            consecutive_errors: self.scheduler.consecutive_errors(),
            candle_count: self.series.len(),
            last_known_price: self.series.last_known_price(),
            reason: self.reason.clone(),
        }
    }

    async fn publish_status(&mut self) {
        let snapshot = self.status_snapshot();
        let mut writable = self.status.write().await;
        *writable = snapshot;
    }
}
