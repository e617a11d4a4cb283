//! Underlying OHLCV bar aggregation.
//!
//! Ticks from every account funnel into one working bar per symbol.
//! Duplicate prints seen from multiple accounts are dropped by a
//! `(ts_ms, price)` heuristic before volume accumulates. A timer emits
//! the working bar at the window boundary even when no further ticks
//! arrive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::bus::{underlying_topic, Publisher};
use crate::models::{class_of_symbol, UnderlyingBar};

struct WorkingBar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    start_ts: u64,
    is_mock: bool,
    /// Prints already counted in this window.
    seen: HashSet<(u64, u64)>,
}

impl WorkingBar {
    fn new(price: f64, start_ts: u64, is_mock: bool) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            start_ts,
            is_mock,
            seen: HashSet::new(),
        }
    }

    fn to_bar(&self, symbol: &str) -> UnderlyingBar {
        UnderlyingBar {
            symbol: symbol.to_string(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            ts_sec: self.start_ts,
            is_mock: self.is_mock,
        }
    }
}

pub struct BarAggregator {
    interval_secs: u64,
    publisher: Arc<Publisher>,
    bars: Mutex<HashMap<String, WorkingBar>>,
}

impl BarAggregator {
    pub fn new(interval_secs: u64, publisher: Arc<Publisher>) -> Arc<Self> {
        Arc::new(Self {
            interval_secs: interval_secs.max(1),
            publisher,
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn window_start(&self, ts_sec: u64) -> u64 {
        ts_sec - ts_sec % self.interval_secs
    }

    /// Fold one underlying tick into the working bar for its symbol.
    /// Crossing a window boundary emits the finished bar first.
    pub async fn on_tick(
        &self,
        _account_id: &str,
        symbol: &str,
        price: f64,
        qty_delta: u64,
        ts_ms: u64,
        is_mock: bool,
    ) {
        let window = self.window_start(ts_ms / 1000);
        let finished: Option<UnderlyingBar> = {
            let mut bars = self.bars.lock();
            match bars.get_mut(symbol) {
                None => {
                    bars.insert(symbol.to_string(), WorkingBar::new(price, window, is_mock));
                    None
                }
                Some(bar) if window == bar.start_ts => {
                    // Same print relayed by another account: ignore for
                    // both price and volume.
                    if bar.seen.insert((ts_ms, price.to_bits())) {
                        bar.high = bar.high.max(price);
                        bar.low = bar.low.min(price);
                        bar.close = price;
                        bar.volume += qty_delta;
                        bar.is_mock |= is_mock;
                    }
                    None
                }
                Some(bar) => {
                    let finished = bar.to_bar(symbol);
                    *bar = WorkingBar::new(price, window, is_mock);
                    bar.seen.insert((ts_ms, price.to_bits()));
                    bar.volume += qty_delta;
                    Some(finished)
                }
            }
        };

        if let Some(bar) = finished {
            self.emit(bar).await;
        }
    }

    async fn emit(&self, bar: UnderlyingBar) {
        let topic = underlying_topic(&class_of_symbol(&bar.symbol));
        match serde_json::to_vec(&bar) {
            Ok(payload) => {
                debug!(symbol = %bar.symbol, ts = bar.ts_sec, close = bar.close, "bar emitted");
                metrics::increment_counter!("bars_emitted", "symbol" => bar.symbol.clone());
                self.publisher.publish(&topic, payload).await;
            }
            Err(e) => debug!(error = %e, "bar serialization failed"),
        }
    }

    /// Emit any working bar whose window has elapsed, rolling it into a
    /// fresh bar seeded at the last close.
    pub async fn flush_elapsed(&self, now_sec: u64) {
        let window = self.window_start(now_sec);
        let due: Vec<UnderlyingBar> = {
            let mut bars = self.bars.lock();
            let mut out = Vec::new();
            for (symbol, bar) in bars.iter_mut() {
                if bar.start_ts < window {
                    out.push(bar.to_bar(symbol));
                    *bar = WorkingBar::new(bar.close, window, bar.is_mock);
                }
            }
            out
        };
        for bar in due {
            self.emit(bar).await;
        }
    }

    /// Interval timer driving [`flush_elapsed`].
    pub async fn run_timer(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_elapsed(chrono::Utc::now().timestamp() as u64).await;
                }
                _ = cancel.changed() => return Ok(()),
            }
        }
    }
}
