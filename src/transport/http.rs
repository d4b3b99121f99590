use crate::error::SyncError;
use crate::market::types::{parse_candle_batch_payload, SeriesKey, Timeframe, WireRecord};
use crate::transport::PollSource;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

fn klines_endpoint(base_url: &str, symbol: &str, timeframe: Timeframe, limit: u16) -> String {
    format!("{}/api/kline/{}", base_url.trim_end_matches('/'), symbol.to_ascii_uppercase())
        + &format!("?timeframe={}&limit={limit}", timeframe.as_str())
}

/// Poll source backed by the market-data service's REST endpoint.
pub struct HttpPollSource {
    client: Client,
    base_url: String,
}

impl HttpPollSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch_candles(&self, key: &SeriesKey, limit: u16) -> Result<Vec<WireRecord>, SyncError> {
        let endpoint = klines_endpoint(&self.base_url, &key.symbol, key.timeframe, limit);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let mut payload = response.bytes().await?.to_vec();
        let records = parse_candle_batch_payload(&mut payload)?;
        debug!(symbol = %key.symbol, timeframe = %key.timeframe, limit, records = records.len(), "kline poll fetched");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_full_reload_endpoint() {
        let endpoint = klines_endpoint("http://localhost:8080", "btcusdt", Timeframe::M1, 50);
        assert_eq!(
            endpoint,
            "http://localhost:8080/api/kline/BTCUSDT?timeframe=1m&limit=50"
        );
    }

    #[test]
    fn builds_incremental_endpoint_with_trailing_slash_base() {
        let endpoint = klines_endpoint("https://md.example.org/", "ETHUSDT", Timeframe::H1, 2);
        assert_eq!(
            endpoint,
            "https://md.example.org/api/kline/ETHUSDT?timeframe=1h&limit=2"
        );
    }
}
