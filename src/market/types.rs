use crate::error::SyncError;
use crate::market::{INITIAL_TOPIC_SUFFIX, KLINE_TOPIC_PREFIX};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M1;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_AUTO_REFRESH: bool = true;
pub const DEFAULT_MAX_CANDLES: usize = 50;
pub const DEFAULT_CHART_KIND: ChartKind = ChartKind::Candlestick;
pub const DEFAULT_CHART_WIDTH: u32 = 800;
pub const DEFAULT_CHART_HEIGHT: u32 = 400;
pub const DEFAULT_HTTP_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";
pub const MIN_REFRESH_INTERVAL_MS: u64 = 1_000;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 300_000;
pub const MIN_MAX_CANDLES: usize = 10;
pub const MAX_MAX_CANDLES: usize = 1_000;
pub const BACKOFF_THRESHOLD: u32 = 5;
pub const BACKOFF_DURATION_MS: u64 = 5_000;
pub const INCREMENTAL_FETCH_LIMIT: u16 = 2;
pub const HEARTBEAT_SENTINEL_PRICE: f64 = 0.001;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "5s")]
    S5,
    #[serde(rename = "30s")]
    S30,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::S5 => "5s",
            Self::S30 => "30s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, SyncError> {
        match value.trim() {
            "1s" => Ok(Self::S1),
            "5s" => Ok(Self::S5),
            "30s" => Ok(Self::S30),
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "1d" => Ok(Self::D1),
            other => Err(SyncError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (symbol, timeframe) pair a client is currently displaying.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Result<Self, SyncError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            timeframe,
        })
    }

    pub fn topic(&self) -> String {
        format!("{KLINE_TOPIC_PREFIX}/{}/{}", self.symbol, self.timeframe)
    }

    pub fn initial_topic(&self) -> String {
        format!("{}{INITIAL_TOPIC_SUFFIX}", self.topic())
    }

    /// Whether a message tagged with these wire fields belongs to this key.
    /// Absent fields fall back to the topic the message arrived on.
    pub fn accepts(&self, symbol: Option<&str>, timeframe: Option<&str>, topic: &str) -> bool {
        let symbol_matches = match symbol {
            Some(value) => value.trim().eq_ignore_ascii_case(&self.symbol),
            None => topic == self.topic(),
        };
        let timeframe_matches = match timeframe {
            Some(value) => Timeframe::parse_str(value).is_ok_and(|timeframe| timeframe == self.timeframe),
            None => topic == self.topic(),
        };
        symbol_matches && timeframe_matches
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

pub fn normalize_symbol(symbol: &str) -> Result<String, SyncError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(SyncError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Candlestick,
    Line,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub kind: ChartKind,
    pub width: u32,
    pub height: u32,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_CHART_KIND,
            width: DEFAULT_CHART_WIDTH,
            height: DEFAULT_CHART_HEIGHT,
        }
    }
}

/// A validated candle. Prices always satisfy `low <= min(open, close)` and
/// `high >= max(open, close)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    pub trade_count: Option<u64>,
}

/// A numeric wire field as the server may send it: a JSON number, a numeric
/// string, or something unusable.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

impl WireNumber {
    /// Finite value or `0.0`.
    pub fn value(&self) -> f64 {
        let parsed = match self {
            Self::Number(value) => *value,
            Self::Text(text) => text.trim().parse::<f64>().unwrap_or(0.0),
            Self::Other(_) => 0.0,
        };
        if parsed.is_finite() {
            parsed
        } else {
            0.0
        }
    }
}

pub fn wire_value(field: &Option<WireNumber>) -> f64 {
    field.as_ref().map(WireNumber::value).unwrap_or(0.0)
}

/// Candle record exactly as received; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandle {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default, alias = "time", alias = "startTime")]
    pub timestamp: Option<WireNumber>,
    #[serde(default)]
    pub open: Option<WireNumber>,
    #[serde(default)]
    pub high: Option<WireNumber>,
    #[serde(default)]
    pub low: Option<WireNumber>,
    #[serde(default)]
    pub close: Option<WireNumber>,
    #[serde(default)]
    pub volume: Option<WireNumber>,
    #[serde(default)]
    pub amount: Option<WireNumber>,
    #[serde(default)]
    pub trade_count: Option<WireNumber>,
}

/// One element of a batch payload. Elements that are not candle objects are
/// kept so they can be rejected one by one instead of failing the batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    Candle(RawCandle),
    Unparseable(IgnoredAny),
}

pub fn parse_candle_payload(payload: &mut [u8]) -> Result<RawCandle, SyncError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

pub fn parse_candle_batch_payload(payload: &mut [u8]) -> Result<Vec<WireRecord>, SyncError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChartSyncArgs {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub refresh_interval_ms: Option<u64>,
    pub auto_refresh: Option<bool>,
    pub max_candles: Option<usize>,
    pub chart_kind: Option<ChartKind>,
    pub chart_width: Option<u32>,
    pub chart_height: Option<u32>,
    pub http_base_url: Option<String>,
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChartSyncConfig {
    pub key: SeriesKey,
    pub refresh_interval_ms: u64,
    pub auto_refresh: bool,
    pub max_candles: usize,
    pub chart: ChartConfig,
    pub http_base_url: String,
    pub ws_url: String,
}

pub fn validate_refresh_interval(refresh_interval_ms: u64) -> Result<u64, SyncError> {
    if !(MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&refresh_interval_ms) {
        return Err(SyncError::InvalidArgument(format!(
            "refreshIntervalMs must be between {MIN_REFRESH_INTERVAL_MS} and {MAX_REFRESH_INTERVAL_MS}"
        )));
    }
    Ok(refresh_interval_ms)
}

fn normalize_url(value: Option<String>, default: &str, schemes: &[&str]) -> Result<String, SyncError> {
    let url = value
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string());
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(SyncError::InvalidArgument(format!(
            "url '{url}' must start with one of {schemes:?}"
        )));
    }
    Ok(url)
}

impl StartChartSyncArgs {
    pub fn normalize(self) -> Result<ChartSyncConfig, SyncError> {
        let symbol = self.symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);
        let key = SeriesKey::new(&symbol, timeframe)?;

        let refresh_interval_ms = validate_refresh_interval(
            self.refresh_interval_ms
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS),
        )?;
        let auto_refresh = self.auto_refresh.unwrap_or(DEFAULT_AUTO_REFRESH);

        let max_candles = self.max_candles.unwrap_or(DEFAULT_MAX_CANDLES);
        if !(MIN_MAX_CANDLES..=MAX_MAX_CANDLES).contains(&max_candles) {
            return Err(SyncError::InvalidArgument(format!(
                "maxCandles must be between {MIN_MAX_CANDLES} and {MAX_MAX_CANDLES}"
            )));
        }

        let width = self.chart_width.unwrap_or(DEFAULT_CHART_WIDTH);
        let height = self.chart_height.unwrap_or(DEFAULT_CHART_HEIGHT);
        if width == 0 || height == 0 {
            return Err(SyncError::InvalidArgument(
                "chart dimensions must be non-zero".to_string(),
            ));
        }
        let chart = ChartConfig {
            kind: self.chart_kind.unwrap_or(DEFAULT_CHART_KIND),
            width,
            height,
        };

        let http_base_url =
            normalize_url(self.http_base_url, DEFAULT_HTTP_BASE_URL, &["http://", "https://"])?;
        let ws_url = normalize_url(self.ws_url, DEFAULT_WS_URL, &["ws://", "wss://"])?;

        Ok(ChartSyncConfig {
            key,
            refresh_interval_ms,
            auto_refresh,
            max_candles,
            chart,
            http_base_url,
            ws_url,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchSeriesArgs {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SwitchSeriesArgs {
    pub fn normalize(self) -> Result<SeriesKey, SyncError> {
        SeriesKey::new(&self.symbol, self.timeframe)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSyncSession {
    pub running: bool,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub refresh_interval_ms: u64,
    pub auto_refresh: bool,
    pub max_candles: usize,
    pub chart_kind: ChartKind,
}

impl ChartSyncSession {
    pub fn from_config(config: &ChartSyncConfig) -> Self {
        Self {
            running: true,
            symbol: config.key.symbol.clone(),
            timeframe: config.key.timeframe,
            refresh_interval_ms: config.refresh_interval_ms,
            auto_refresh: config.auto_refresh,
            max_candles: config.max_candles,
            chart_kind: config.chart.kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSyncStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Initializing,
    Live,
    Degraded,
    Terminal,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Unsubscribed,
    Pending,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub phase: SyncPhase,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub feed_state: FeedState,
    pub push_connected: bool,
    pub polling: bool,
    pub visible: bool,
    pub consecutive_errors: u32,
    pub candle_count: usize,
    pub last_known_price: Option<f64>,
    pub reason: Option<String>,
}

impl SyncStatusSnapshot {
    pub fn stopped(symbol: String, reason: Option<String>) -> Self {
        Self {
            phase: SyncPhase::Stopped,
            symbol,
            timeframe: DEFAULT_TIMEFRAME,
            feed_state: FeedState::Unsubscribed,
            push_connected: false,
            polling: false,
            visible: true,
            consecutive_errors: 0,
            candle_count: 0,
            last_known_price: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl From<&Candle> for UiCandle {
    fn from(candle: &Candle) -> Self {
        Self {
            t: candle.start_time,
            o: candle.open,
            h: candle.high,
            l: candle.low,
            c: candle.close,
            v: candle.volume.unwrap_or(0.0).max(0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiLinePoint {
    pub t: i64,
    pub v: f64,
}

impl From<&Candle> for UiLinePoint {
    fn from(candle: &Candle) -> Self {
        Self {
            t: candle.start_time,
            v: candle.close,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "style", content = "points", rename_all = "lowercase")]
pub enum UiSeriesData {
    Candlestick(Vec<UiCandle>),
    Line(Vec<UiLinePoint>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "style", content = "point", rename_all = "lowercase")]
pub enum UiSeriesPoint {
    Candlestick(UiCandle),
    Line(UiLinePoint),
}

/// Frames the shipped chart backend sends to the host UI.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChartFrame {
    ChartCreated { chart_id: u64, config: ChartConfig },
    SeriesData { chart_id: u64, data: UiSeriesData },
    SeriesUpdate { chart_id: u64, point: UiSeriesPoint },
    ChartRemoved { chart_id: u64 },
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub fn now_unix_secs() -> i64 {
    now_unix_ms() / 1_000
}
