use crate::error::SyncError;
use crate::market::types::{
    validate_refresh_interval, BACKOFF_DURATION_MS, BACKOFF_THRESHOLD, INCREMENTAL_FETCH_LIMIT,
};
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval_ms: u64,
    pub enabled: bool,
    pub consecutive_error_count: u32,
    pub backoff_threshold: u32,
    pub backoff_duration_ms: u64,
}

impl RefreshPolicy {
    pub fn new(interval_ms: u64, enabled: bool) -> Result<Self, SyncError> {
        Ok(Self {
            interval_ms: validate_refresh_interval(interval_ms)?,
            enabled,
            consecutive_error_count: 0,
            backoff_threshold: BACKOFF_THRESHOLD,
            backoff_duration_ms: BACKOFF_DURATION_MS,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    FullReload,
    Incremental,
}

impl RefreshMode {
    pub fn fetch_limit(self, max_candles: usize) -> u16 {
        match self {
            Self::FullReload => max_candles.min(u16::MAX as usize) as u16,
            Self::Incremental => INCREMENTAL_FETCH_LIMIT,
        }
    }
}

/// Who asked for a refresh. Only timer ticks are gated by visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Timer,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Started { seq: u64, mode: RefreshMode },
    SkippedInFlight,
    SkippedHidden,
    SkippedStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The completion does not belong to the current in-flight refresh.
    Ignored,
    Succeeded,
    Failed { consecutive: u32 },
    BackoffStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Tick,
    Resume,
}

pub struct PollScheduler {
    policy: RefreshPolicy,
    timer: Option<Interval>,
    resume_at: Option<Instant>,
    in_flight: Option<u64>,
    next_seq: u64,
    visible: bool,
    running: bool,
}

impl PollScheduler {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            timer: None,
            resume_at: None,
            in_flight: None,
            next_seq: 1,
            visible: true,
            running: false,
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.policy.consecutive_error_count
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_ticking(&self) -> bool {
        self.timer.is_some()
    }

    pub fn in_backoff(&self) -> bool {
        self.resume_at.is_some()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn start(&mut self) {
        self.running = true;
        if self.policy.enabled && self.resume_at.is_none() {
            self.arm();
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.timer = None;
        self.resume_at = None;
        self.in_flight = None;
    }

    fn arm(&mut self) {
        let period = Duration::from_millis(self.policy.interval_ms);
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.timer = Some(timer);
    }

    /// Waits for the next timer tick or the backoff resume. Pending forever
    /// while neither is armed. Cancel safe.
    pub async fn next_event(&mut self) -> SchedulerEvent {
        if let Some(resume_at) = self.resume_at {
            sleep_until(resume_at).await;
            self.resume_at = None;
            return SchedulerEvent::Resume;
        }

        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
                SchedulerEvent::Tick
            }
            None => std::future::pending().await,
        }
    }

    pub fn begin_refresh(&mut self, mode: RefreshMode, trigger: RefreshTrigger) -> RefreshOutcome {
        if !self.running {
            return RefreshOutcome::SkippedStopped;
        }
        if self.in_flight.is_some() {
            debug!(?mode, "refresh already in flight; skipped");
            return RefreshOutcome::SkippedInFlight;
        }
        if trigger == RefreshTrigger::Timer && !self.visible {
            return RefreshOutcome::SkippedHidden;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(seq);
        RefreshOutcome::Started { seq, mode }
    }

    pub fn finish_refresh(&mut self, seq: u64, ok: bool) -> FinishOutcome {
        if self.in_flight != Some(seq) {
            return FinishOutcome::Ignored;
        }
        self.in_flight = None;

        if ok {
            self.policy.consecutive_error_count = 0;
            return FinishOutcome::Succeeded;
        }

        self.policy.consecutive_error_count += 1;
        let consecutive = self.policy.consecutive_error_count;
        if consecutive >= self.policy.backoff_threshold && self.resume_at.is_none() && self.running {
            self.timer = None;
            self.resume_at =
                Some(Instant::now() + Duration::from_millis(self.policy.backoff_duration_ms));
            warn!(
                consecutive,
                backoff_ms = self.policy.backoff_duration_ms,
                "poll failures reached threshold; polling paused"
            );
            return FinishOutcome::BackoffStarted;
        }
        FinishOutcome::Failed { consecutive }
    }

    /// Called after a `Resume` event: clears the error count and restarts ticking.
    pub fn on_resume(&mut self) {
        self.policy.consecutive_error_count = 0;
        if self.running && self.policy.enabled {
            self.arm();
        }
        info!(interval_ms = self.policy.interval_ms, "polling resumed after backoff");
    }

    /// Forgets the in-flight refresh so its completion will be ignored.
    pub fn abandon_in_flight(&mut self) -> Option<u64> {
        self.in_flight.take()
    }

    /// Returns true when the surface just became visible.
    pub fn set_visible(&mut self, visible: bool) -> bool {
        let became_visible = visible && !self.visible;
        self.visible = visible;
        became_visible
    }

    pub fn set_interval_ms(&mut self, interval_ms: u64) -> Result<(), SyncError> {
        self.policy.interval_ms = validate_refresh_interval(interval_ms)?;
        if self.timer.is_some() {
            self.arm();
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.policy.enabled = enabled;
        if !enabled {
            self.timer = None;
        } else if self.running && self.resume_at.is_none() && self.timer.is_none() {
            self.arm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(interval_ms: u64) -> PollScheduler {
        PollScheduler::new(RefreshPolicy::new(interval_ms, true).expect("valid policy"))
    }

    fn started(outcome: RefreshOutcome) -> u64 {
        match outcome {
            RefreshOutcome::Started { seq, .. } => seq,
            other => panic!("expected refresh to start, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_interval() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();
        let start = Instant::now();

        assert_eq!(scheduler.next_event().await, SchedulerEvent::Tick);
        assert_eq!(start.elapsed(), Duration::from_millis(3_000));
        assert_eq!(scheduler.next_event().await, SchedulerEvent::Tick);
        assert_eq!(start.elapsed(), Duration::from_millis(6_000));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_refresh_is_skipped() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
        assert_eq!(
            scheduler.begin_refresh(RefreshMode::FullReload, RefreshTrigger::Host),
            RefreshOutcome::SkippedInFlight
        );
        assert_eq!(scheduler.finish_refresh(seq, true), FinishOutcome::Succeeded);
        started(scheduler.begin_refresh(RefreshMode::FullReload, RefreshTrigger::Host));
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_pause_then_resume_once() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        for expected in 1..=4 {
            let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
            assert_eq!(
                scheduler.finish_refresh(seq, false),
                FinishOutcome::Failed { consecutive: expected }
            );
        }
        let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
        assert_eq!(scheduler.finish_refresh(seq, false), FinishOutcome::BackoffStarted);
        assert!(!scheduler.is_ticking());
        assert!(scheduler.in_backoff());

        let paused_at = Instant::now();
        assert_eq!(scheduler.next_event().await, SchedulerEvent::Resume);
        assert_eq!(paused_at.elapsed(), Duration::from_millis(5_000));

        scheduler.on_resume();
        assert_eq!(scheduler.consecutive_errors(), 0);
        assert!(!scheduler.in_backoff());

        let resumed_at = Instant::now();
        assert_eq!(scheduler.next_event().await, SchedulerEvent::Tick);
        assert_eq!(resumed_at.elapsed(), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_error_count() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        for _ in 0..3 {
            let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
            scheduler.finish_refresh(seq, false);
        }
        let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
        scheduler.finish_refresh(seq, true);

        assert_eq!(scheduler.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_completion_is_ignored() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        let seq = started(scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer));
        assert_eq!(scheduler.abandon_in_flight(), Some(seq));
        let next = started(scheduler.begin_refresh(RefreshMode::FullReload, RefreshTrigger::Host));

        assert_eq!(scheduler.finish_refresh(seq, false), FinishOutcome::Ignored);
        assert_eq!(scheduler.consecutive_errors(), 0);
        assert_eq!(scheduler.in_flight(), Some(next));
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_surface_gates_timer_refresh_only() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        assert!(!scheduler.set_visible(false));
        assert_eq!(
            scheduler.begin_refresh(RefreshMode::Incremental, RefreshTrigger::Timer),
            RefreshOutcome::SkippedHidden
        );
        started(scheduler.begin_refresh(RefreshMode::FullReload, RefreshTrigger::Host));
        assert!(scheduler.set_visible(true));
        assert!(!scheduler.set_visible(true));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_interval_keeps_running_timer() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        assert!(scheduler.set_interval_ms(500).is_err());
        assert_eq!(scheduler.policy().interval_ms, 3_000);

        scheduler.set_interval_ms(1_000).expect("interval in range");
        let start = Instant::now();
        assert_eq!(scheduler.next_event().await, SchedulerEvent::Tick);
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_auto_refresh_stops_timer() {
        let mut scheduler = scheduler(3_000);
        scheduler.start();

        scheduler.set_enabled(false);
        assert!(!scheduler.is_ticking());
        scheduler.set_enabled(true);
        assert!(scheduler.is_ticking());

        scheduler.stop();
        assert_eq!(
            scheduler.begin_refresh(RefreshMode::FullReload, RefreshTrigger::Host),
            RefreshOutcome::SkippedStopped
        );
    }

    #[test]
    fn fetch_limit_depends_on_mode() {
        assert_eq!(RefreshMode::FullReload.fetch_limit(50), 50);
        assert_eq!(RefreshMode::Incremental.fetch_limit(50), 2);
    }
}
