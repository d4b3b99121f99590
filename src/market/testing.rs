use crate::error::SyncError;
use crate::market::render::{ChartBackend, ChartSeries, ChartSurface, RenderError};
use crate::market::types::{
    parse_candle_batch_payload, Candle, ChartConfig, ChartKind, SeriesKey, Timeframe, WireRecord,
};
use crate::transport::{PollSource, PushControl};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub fn candle(start_time: i64, close: f64) -> Candle {
    Candle {
        symbol: "BTCUSDT".to_string(),
        timeframe: Timeframe::M1,
        start_time,
        open: close,
        high: close,
        low: close,
        close,
        volume: None,
        amount: None,
        trade_count: None,
    }
}

pub fn records(json: &str) -> Vec<WireRecord> {
    let mut bytes = json.as_bytes().to_vec();
    parse_candle_batch_payload(&mut bytes).expect("test batch should parse")
}

pub fn candle_json(start_time: i64, close: f64) -> String {
    format!(
        r#"{{"timestamp":{start_time},"open":{close},"high":{close},"low":{close},"close":{close}}}"#
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCall {
    Subscribe(SeriesKey, String),
    Unsubscribe(SeriesKey, String),
}

#[derive(Default)]
pub struct FakePushControl {
    calls: Mutex<Vec<PushCall>>,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

impl FakePushControl {
    pub fn calls(&self) -> Vec<PushCall> {
        self.calls.lock().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, PushCall::Subscribe(..)))
            .count()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, PushCall::Unsubscribe(..)))
            .count()
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushControl for FakePushControl {
    async fn subscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError> {
        self.calls
            .lock()
            .push(PushCall::Subscribe(key.clone(), session_id.to_string()));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed("fake push channel down".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, key: &SeriesKey, session_id: &str) -> Result<(), SyncError> {
        self.calls
            .lock()
            .push(PushCall::Unsubscribe(key.clone(), session_id.to_string()));
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed("fake push channel down".to_string()));
        }
        Ok(())
    }
}

type Responder = Box<dyn Fn(&SeriesKey, u16) -> Vec<WireRecord> + Send + Sync>;

pub struct FakePollSource {
    responder: Responder,
    calls: Mutex<Vec<(SeriesKey, u16)>>,
    failing: AtomicBool,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakePollSource {
    pub fn new(responder: impl Fn(&SeriesKey, u16) -> Vec<WireRecord> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(|_, _| Vec::new())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(SeriesKey, u16)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Holds fetches for `symbol` until the returned gate is notified.
    pub fn gate(&self, symbol: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(symbol.to_string(), gate.clone());
        gate
    }
}

#[async_trait]
impl PollSource for FakePollSource {
    async fn fetch_candles(&self, key: &SeriesKey, limit: u16) -> Result<Vec<WireRecord>, SyncError> {
        self.calls.lock().push((key.clone(), limit));
        let gate = self.gates.lock().get(&key.symbol).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed("fake poll endpoint down".to_string()));
        }
        Ok((self.responder)(key, limit))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeChartLog {
    pub charts_created: usize,
    pub charts_removed: usize,
    pub series_kinds: Vec<ChartKind>,
    pub set_data_calls: Vec<Vec<i64>>,
    pub updates: Vec<(i64, f64)>,
    detached: bool,
    fail_create_chart: bool,
    fail_updates: usize,
    generation: u64,
    valid_generation: Option<u64>,
}

#[derive(Clone, Default)]
pub struct FakeChartBackend {
    log: Arc<Mutex<FakeChartLog>>,
}

impl FakeChartBackend {
    pub fn log(&self) -> FakeChartLog {
        self.log.lock().clone()
    }

    pub fn detach(&self) {
        self.log.lock().detached = true;
    }

    pub fn invalidate_handles(&self) {
        self.log.lock().valid_generation = None;
    }

    pub fn fail_create_chart(&self, fail: bool) {
        self.log.lock().fail_create_chart = fail;
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.log.lock().fail_updates = count;
    }
}

impl ChartBackend for FakeChartBackend {
    fn host_attached(&self) -> bool {
        !self.log.lock().detached
    }

    fn create_chart(&mut self, _config: &ChartConfig) -> Result<Box<dyn ChartSurface>, RenderError> {
        let mut log = self.log.lock();
        if log.fail_create_chart {
            return Err(RenderError::Backend("fake chart creation failed".to_string()));
        }
        log.generation += 1;
        log.valid_generation = Some(log.generation);
        log.charts_created += 1;
        Ok(Box::new(FakeSurface {
            log: self.log.clone(),
            generation: log.generation,
        }))
    }
}

struct FakeSurface {
    log: Arc<Mutex<FakeChartLog>>,
    generation: u64,
}

impl ChartSurface for FakeSurface {
    fn is_valid(&self) -> bool {
        self.log.lock().valid_generation == Some(self.generation)
    }

    fn create_series(&mut self, kind: ChartKind) -> Result<Box<dyn ChartSeries>, RenderError> {
        self.log.lock().series_kinds.push(kind);
        Ok(Box::new(FakeSeries {
            log: self.log.clone(),
            generation: self.generation,
        }))
    }

    fn remove(&mut self) {
        let mut log = self.log.lock();
        log.charts_removed += 1;
        if log.valid_generation == Some(self.generation) {
            log.valid_generation = None;
        }
    }
}

struct FakeSeries {
    log: Arc<Mutex<FakeChartLog>>,
    generation: u64,
}

impl ChartSeries for FakeSeries {
    fn is_valid(&self) -> bool {
        self.log.lock().valid_generation == Some(self.generation)
    }

    fn set_data(&mut self, candles: &[Candle]) -> Result<(), RenderError> {
        self.log
            .lock()
            .set_data_calls
            .push(candles.iter().map(|candle| candle.start_time).collect());
        Ok(())
    }

    fn update(&mut self, candle: &Candle) -> Result<(), RenderError> {
        let mut log = self.log.lock();
        if log.fail_updates > 0 {
            log.fail_updates -= 1;
            return Err(RenderError::Backend("fake update failed".to_string()));
        }
        log.updates.push((candle.start_time, candle.close));
        Ok(())
    }
}
