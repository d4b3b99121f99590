use crate::market::series::SeriesState;
use crate::market::types::{
    now_unix_secs, wire_value, Candle, RawCandle, SeriesKey, WireRecord, HEARTBEAT_SENTINEL_PRICE,
};
use thiserror::Error;
use tracing::{debug, warn};

const ONE_YEAR_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("candle has no start time")]
    MissingStartTime,
    #[error("candle start time {0} is not positive")]
    NonPositiveStartTime(i64),
    #[error("record is not a candle object")]
    Unparseable,
}

/// Turns a raw wire record into a well-formed candle for `key`.
///
/// Start times are whole seconds: a fractional timestamp is truncated before
/// the positivity check, so anything below one second is rejected.
///
/// Heartbeats (all four prices zero) take the series' last known price, or
/// the sentinel when none is known yet. Inconsistent OHLC is repaired rather
/// than rejected. A positive close becomes the series' last known price.
pub fn validate_candle(
    raw: &RawCandle,
    key: &SeriesKey,
    series: &mut SeriesState,
) -> Result<Candle, Rejected> {
    let start_time = match raw.timestamp.as_ref() {
        Some(timestamp) => timestamp.value().trunc() as i64,
        None => return Err(Rejected::MissingStartTime),
    };
    if start_time <= 0 {
        return Err(Rejected::NonPositiveStartTime(start_time));
    }
    if (start_time - now_unix_secs()).abs() > ONE_YEAR_SECS {
        warn!(
            symbol = %key.symbol,
            timeframe = %key.timeframe,
            start_time,
            "candle start time is more than a year from now; milliseconds sent as seconds?"
        );
    }

    let mut open = wire_value(&raw.open);
    let mut high = wire_value(&raw.high);
    let mut low = wire_value(&raw.low);
    let mut close = wire_value(&raw.close);

    if open == 0.0 && high == 0.0 && low == 0.0 && close == 0.0 {
        let price = series
            .last_known_price()
            .unwrap_or(HEARTBEAT_SENTINEL_PRICE);
        debug!(symbol = %key.symbol, start_time, price, "heartbeat candle substituted");
        open = price;
        high = price;
        low = price;
        close = price;
    } else {
        let body_high = open.max(close);
        let body_low = open.min(close);

        if high < low {
            warn!(symbol = %key.symbol, start_time, high, low, "candle high below low; reset to body");
            high = body_high;
            low = body_low;
        }
        if high < body_high {
            warn!(symbol = %key.symbol, start_time, high, body_high, "candle high raised to body");
            high = body_high;
        }
        if low > body_low {
            warn!(symbol = %key.symbol, start_time, low, body_low, "candle low lowered to body");
            low = body_low;
        }
    }

    series.note_price(close);

    Ok(Candle {
        symbol: key.symbol.clone(),
        timeframe: key.timeframe,
        start_time,
        open,
        high,
        low,
        close,
        volume: raw.volume.as_ref().map(|value| value.value()),
        amount: raw.amount.as_ref().map(|value| value.value()),
        trade_count: raw
            .trade_count
            .as_ref()
            .map(|value| value.value().max(0.0) as u64),
    })
}

pub fn validate_record(
    record: &WireRecord,
    key: &SeriesKey,
    series: &mut SeriesState,
) -> Result<Candle, Rejected> {
    match record {
        WireRecord::Candle(raw) => validate_candle(raw, key, series),
        WireRecord::Unparseable(_) => Err(Rejected::Unparseable),
    }
}

/// Validates every record of a batch in order, dropping rejected ones.
pub fn validate_batch(records: &[WireRecord], key: &SeriesKey, series: &mut SeriesState) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(records.len());
    for record in records {
        match validate_record(record, key, series) {
            Ok(candle) => candles.push(candle),
            Err(reason) => {
                warn!(symbol = %key.symbol, timeframe = %key.timeframe, %reason, "candle record rejected");
            }
        }
    }
    candles
}
