use crate::market::types::{Candle, ChartConfig, ChartKind};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("host surface is detached")]
    HostDetached,
    #[error("chart handle is no longer valid")]
    InvalidHandle,
    #[error("chart backend failure: {0}")]
    Backend(String),
}

/// Creates charts on the host surface.
pub trait ChartBackend: Send {
    fn host_attached(&self) -> bool;
    fn create_chart(&mut self, config: &ChartConfig) -> Result<Box<dyn ChartSurface>, RenderError>;
}

pub trait ChartSurface: Send {
    fn is_valid(&self) -> bool;
    fn create_series(&mut self, kind: ChartKind) -> Result<Box<dyn ChartSeries>, RenderError>;
    fn remove(&mut self);
}

pub trait ChartSeries: Send {
    fn is_valid(&self) -> bool;
    fn set_data(&mut self, candles: &[Candle]) -> Result<(), RenderError>;
    fn update(&mut self, candle: &Candle) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Applied,
    /// The surface was rebuilt and the full snapshot replayed.
    Rebuilt,
    Terminal(String),
}

enum Health {
    Ready,
    Rebuilt,
    Terminal(String),
}

/// Guards every render call: handles are checked first, and a missing or
/// failed handle gets exactly one rebuild before the surface is declared dead.
pub struct RenderHealthMonitor {
    backend: Box<dyn ChartBackend>,
    config: ChartConfig,
    chart: Option<Box<dyn ChartSurface>>,
    series: Option<Box<dyn ChartSeries>>,
    terminal: Option<String>,
}

impl RenderHealthMonitor {
    pub fn new(backend: Box<dyn ChartBackend>, config: ChartConfig) -> Self {
        Self {
            backend,
            config,
            chart: None,
            series: None,
            terminal: None,
        }
    }

    pub fn terminal_reason(&self) -> Option<&str> {
        self.terminal.as_deref()
    }

    /// Builds the chart for the first time and renders `snapshot`.
    pub fn mount(&mut self, snapshot: &[Candle]) -> RenderOutcome {
        if let Some(reason) = &self.terminal {
            return RenderOutcome::Terminal(reason.clone());
        }
        match self.build(snapshot) {
            Ok(()) => {
                info!(kind = ?self.config.kind, "chart mounted");
                RenderOutcome::Applied
            }
            Err(err) => RenderOutcome::Terminal(self.enter_terminal(err)),
        }
    }

    pub fn ensure_healthy(&mut self, snapshot: &[Candle]) -> bool {
        !matches!(self.check(snapshot), Health::Terminal(_))
    }

    pub fn apply_update(&mut self, candle: &Candle, snapshot: &[Candle]) -> RenderOutcome {
        match self.check(snapshot) {
            Health::Ready => {}
            Health::Rebuilt => return RenderOutcome::Rebuilt,
            Health::Terminal(reason) => return RenderOutcome::Terminal(reason),
        }

        let result = match self.series.as_mut() {
            Some(series) => series.update(candle),
            None => Err(RenderError::InvalidHandle),
        };
        self.after_render_call(result, snapshot)
    }

    pub fn apply_full_replace(&mut self, snapshot: &[Candle]) -> RenderOutcome {
        match self.check(snapshot) {
            Health::Ready => {}
            Health::Rebuilt => return RenderOutcome::Rebuilt,
            Health::Terminal(reason) => return RenderOutcome::Terminal(reason),
        }

        let result = match self.series.as_mut() {
            Some(series) => series.set_data(snapshot),
            None => Err(RenderError::InvalidHandle),
        };
        self.after_render_call(result, snapshot)
    }

    /// Tears the chart down. Safe to call repeatedly.
    pub fn remove(&mut self) {
        self.series = None;
        if let Some(mut chart) = self.chart.take() {
            chart.remove();
            info!("chart removed");
        }
    }

    fn check(&mut self, snapshot: &[Candle]) -> Health {
        if let Some(reason) = &self.terminal {
            return Health::Terminal(reason.clone());
        }
        if !self.backend.host_attached() {
            return Health::Terminal(self.enter_terminal(RenderError::HostDetached));
        }

        let chart_valid = self.chart.as_ref().is_some_and(|chart| chart.is_valid());
        let series_valid = self.series.as_ref().is_some_and(|series| series.is_valid());
        if chart_valid && series_valid {
            return Health::Ready;
        }

        warn!(chart_valid, series_valid, "chart handle invalid; rebuilding");
        self.reconstruct(snapshot)
    }

    fn after_render_call(&mut self, result: Result<(), RenderError>, snapshot: &[Candle]) -> RenderOutcome {
        match result {
            Ok(()) => RenderOutcome::Applied,
            Err(err) => {
                warn!(error = %err, "render call failed; rebuilding chart");
                match self.reconstruct(snapshot) {
                    Health::Terminal(reason) => RenderOutcome::Terminal(reason),
                    Health::Ready | Health::Rebuilt => RenderOutcome::Rebuilt,
                }
            }
        }
    }

    fn reconstruct(&mut self, snapshot: &[Candle]) -> Health {
        self.remove();
        match self.build(snapshot) {
            Ok(()) => {
                info!(candles = snapshot.len(), "chart rebuilt");
                Health::Rebuilt
            }
            Err(err) => Health::Terminal(self.enter_terminal(err)),
        }
    }

    fn build(&mut self, snapshot: &[Candle]) -> Result<(), RenderError> {
        if !self.backend.host_attached() {
            return Err(RenderError::HostDetached);
        }
        let mut chart = self.backend.create_chart(&self.config)?;
        let mut series = match chart.create_series(self.config.kind) {
            Ok(series) => series,
            Err(err) => {
                chart.remove();
                return Err(err);
            }
        };
        if let Err(err) = series.set_data(snapshot) {
            chart.remove();
            return Err(err);
        }

        self.chart = Some(chart);
        self.series = Some(series);
        Ok(())
    }

    fn enter_terminal(&mut self, err: RenderError) -> String {
        self.remove();
        let reason = err.to_string();
        error!(%reason, "chart surface unrecoverable");
        self.terminal = Some(reason.clone());
        reason
    }
}
