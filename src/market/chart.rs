use crate::market::render::{ChartBackend, ChartSeries, ChartSurface, RenderError};
use crate::market::types::{
    Candle, ChartConfig, ChartFrame, ChartKind, UiCandle, UiLinePoint, UiSeriesData, UiSeriesPoint,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Chart backend that streams serializable frames to the host UI. The host
/// counts as detached once it drops the receiving end.
pub struct ChannelChartBackend {
    frames: mpsc::UnboundedSender<ChartFrame>,
    next_chart_id: u64,
}

impl ChannelChartBackend {
    pub fn new(frames: mpsc::UnboundedSender<ChartFrame>) -> Self {
        Self {
            frames,
            next_chart_id: 1,
        }
    }
}

fn send(frames: &mpsc::UnboundedSender<ChartFrame>, frame: ChartFrame) -> Result<(), RenderError> {
    frames.send(frame).map_err(|_| RenderError::HostDetached)
}

impl ChartBackend for ChannelChartBackend {
    fn host_attached(&self) -> bool {
        !self.frames.is_closed()
    }

    fn create_chart(&mut self, config: &ChartConfig) -> Result<Box<dyn ChartSurface>, RenderError> {
        let chart_id = self.next_chart_id;
        self.next_chart_id += 1;
        send(
            &self.frames,
            ChartFrame::ChartCreated {
                chart_id,
                config: *config,
            },
        )?;

        Ok(Box::new(ChannelChart {
            frames: self.frames.clone(),
            chart_id,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct ChannelChart {
    frames: mpsc::UnboundedSender<ChartFrame>,
    chart_id: u64,
    alive: Arc<AtomicBool>,
}

impl ChartSurface for ChannelChart {
    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.frames.is_closed()
    }

    fn create_series(&mut self, kind: ChartKind) -> Result<Box<dyn ChartSeries>, RenderError> {
        if !self.is_valid() {
            return Err(RenderError::InvalidHandle);
        }
        Ok(Box::new(ChannelSeries {
            frames: self.frames.clone(),
            chart_id: self.chart_id,
            kind,
            alive: self.alive.clone(),
        }))
    }

    fn remove(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let _ = self.frames.send(ChartFrame::ChartRemoved {
                chart_id: self.chart_id,
            });
        }
    }
}

struct ChannelSeries {
    frames: mpsc::UnboundedSender<ChartFrame>,
    chart_id: u64,
    kind: ChartKind,
    alive: Arc<AtomicBool>,
}

impl ChartSeries for ChannelSeries {
    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.frames.is_closed()
    }

    fn set_data(&mut self, candles: &[Candle]) -> Result<(), RenderError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(RenderError::InvalidHandle);
        }
        let data = match self.kind {
            ChartKind::Candlestick => UiSeriesData::Candlestick(candles.iter().map(UiCandle::from).collect()),
            ChartKind::Line => UiSeriesData::Line(candles.iter().map(UiLinePoint::from).collect()),
        };
        send(
            &self.frames,
            ChartFrame::SeriesData {
                chart_id: self.chart_id,
                data,
            },
        )
    }

    fn update(&mut self, candle: &Candle) -> Result<(), RenderError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(RenderError::InvalidHandle);
        }
        let point = match self.kind {
            ChartKind::Candlestick => UiSeriesPoint::Candlestick(UiCandle::from(candle)),
            ChartKind::Line => UiSeriesPoint::Line(UiLinePoint::from(candle)),
        };
        send(
            &self.frames,
            ChartFrame::SeriesUpdate {
                chart_id: self.chart_id,
                point,
            },
        )
    }
}
