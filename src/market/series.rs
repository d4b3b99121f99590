use crate::market::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Replaced,
    Appended,
}

/// Bounded candle window for the active series key.
#[derive(Debug, Clone)]
pub struct SeriesState {
    candles: Vec<Candle>,
    max_len: usize,
    last_known_price: Option<f64>,
}

impl SeriesState {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            candles: Vec::with_capacity(max_len + 1),
            max_len,
            last_known_price: None,
        }
    }

    /// Replaces the entry with the same `start_time`, or appends as most recent.
    pub fn upsert(&mut self, candle: Candle) -> UpsertOutcome {
        if let Some(index) = self
            .candles
            .iter()
            .rposition(|existing| existing.start_time == candle.start_time)
        {
            self.candles[index] = candle;
            return UpsertOutcome::Replaced;
        }

        self.candles.push(candle);
        self.trim();
        UpsertOutcome::Appended
    }

    pub fn replace_all(&mut self, candles: Vec<Candle>) {
        self.candles = candles;
        self.trim();
    }

    /// Empties the window and forgets the last known price.
    pub fn clear(&mut self) {
        self.candles.clear();
        self.last_known_price = None;
    }

    pub fn snapshot(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn last_known_price(&self) -> Option<f64> {
        self.last_known_price
    }

    pub fn note_price(&mut self, close: f64) {
        if close > 0.0 && close.is_finite() {
            self.last_known_price = Some(close);
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    fn trim(&mut self) {
        if self.candles.len() > self.max_len {
            let overflow = self.candles.len() - self.max_len;
            self.candles.drain(..overflow);
        }
    }
}
