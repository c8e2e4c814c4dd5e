//! Scripted gateway for tests

use super::types::{OhlcvRow, TradeRecord};
use super::{ExchangeGateway, FetchResult};
use crate::error::FetchError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One recorded fetch
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FetchCall {
    pub kind: &'static str,
    pub symbol: String,
    pub since: Option<i64>,
    pub limit: usize,
}

/// Start or end of one fetch, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FetchEvent {
    Started(String),
    Finished(String),
}

/// Per-symbol script: queued one-shot responses, then an optional repeating one
struct Script<T> {
    queued: VecDeque<FetchResult<T>>,
    fallback: Option<FetchResult<T>>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: None,
        }
    }

    fn next(&mut self) -> FetchResult<T> {
        if let Some(response) = self.queued.pop_front() {
            return response;
        }
        self.fallback
            .clone()
            .unwrap_or_else(|| Err(FetchError::permanent("no scripted response")))
    }
}

pub(crate) struct MockGateway {
    id: String,
    page_size: usize,
    latency: Option<Duration>,
    ohlcv: Mutex<HashMap<String, Script<Vec<OhlcvRow>>>>,
    trades: Mutex<HashMap<String, Script<Vec<TradeRecord>>>>,
    calls: Mutex<Vec<FetchCall>>,
    events: Mutex<Vec<FetchEvent>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MockGateway {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            page_size: 1000,
            latency: None,
            ohlcv: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Every fetch sleeps this long before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a one-shot OHLCV response for `symbol`
    pub fn push_ohlcv(&self, symbol: &str, response: FetchResult<Vec<OhlcvRow>>) {
        self.ohlcv
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .queued
            .push_back(response);
    }

    /// Answer every OHLCV fetch for `symbol` with `response` once the queue is empty
    pub fn always_ohlcv(&self, symbol: &str, response: FetchResult<Vec<OhlcvRow>>) {
        self.ohlcv
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .fallback = Some(response);
    }

    pub fn push_trades(&self, symbol: &str, response: FetchResult<Vec<TradeRecord>>) {
        self.trades
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .queued
            .push_back(response);
    }

    pub fn always_trades(&self, symbol: &str, response: FetchResult<Vec<TradeRecord>>) {
        self.trades
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .fallback = Some(response);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    /// Number of fetches of `kind` issued for `symbol`
    pub fn call_count(&self, kind: &str, symbol: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.kind == kind && c.symbol == symbol)
            .count()
    }

    pub fn events(&self) -> Vec<FetchEvent> {
        self.events.lock().clone()
    }

    /// Most fetches that were ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    async fn begin(&self, kind: &'static str, symbol: &str, since: Option<i64>, limit: usize) -> FetchResult<()> {
        self.calls.lock().push(FetchCall {
            kind,
            symbol: symbol.to_string(),
            since,
            limit,
        });
        self.events.lock().push(FetchEvent::Started(symbol.to_string()));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(FetchEvent::Finished(symbol.to_string()));
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::permanent("connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<OhlcvRow>> {
        self.begin("ohlcv", symbol, since, limit).await?;
        self.ohlcv
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .next()
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<TradeRecord>> {
        self.begin("trades", symbol, since, limit).await?;
        self.trades
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Script::new)
            .next()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}
