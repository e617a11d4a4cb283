//! Synthetic tick generation for out-of-hours operation.
//!
//! State is an immutable underlying snapshot behind an atomic reference
//! (readers never lock) plus an LRU-bounded map of per-option snapshots.
//! All mutation happens under one mutex: a new immutable snapshot is
//! built and swapped in, never edited in place. Eviction runs before
//! every insert: expired contracts first, then LRU trim to the size cap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::MockSettings;
use crate::models::{Instrument, OptionType, RawTick};

/// Doubly-linked LRU over a slab: O(1) get/insert/touch/evict.
struct LruMap<V> {
    map: HashMap<u32, usize>,
    nodes: Vec<LruNode<V>>,
    free: Vec<usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
}

struct LruNode<V> {
    key: u32,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> LruMap<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].next = self.head;
        self.nodes[idx].prev = None;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Get and mark as most recently used.
    fn get(&mut self, key: u32) -> Option<&V> {
        let idx = *self.map.get(&key)?;
        self.unlink(idx);
        self.push_front(idx);
        Some(&self.nodes[idx].value)
    }

    fn insert(&mut self, key: u32, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = value;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = LruNode {
                    key,
                    value,
                    prev: None,
                    next: None,
                };
                idx
            }
            None => {
                self.nodes.push(LruNode {
                    key,
                    value,
                    prev: None,
                    next: None,
                });
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    fn remove(&mut self, key: u32) -> bool {
        let Some(idx) = self.map.remove(&key) else {
            return false;
        };
        self.unlink(idx);
        self.free.push(idx);
        true
    }

    /// Evict the least recently used entry.
    fn pop_lru(&mut self) -> Option<u32> {
        let idx = self.tail?;
        let key = self.nodes[idx].key;
        self.unlink(idx);
        self.map.remove(&key);
        self.free.push(idx);
        Some(key)
    }

    fn keys(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockUnderlyingSnapshot {
    pub token: u32,
    pub symbol: String,
    pub last: f64,
}

#[derive(Debug, Clone)]
struct MockOptionSnapshot {
    last: f64,
    volume: u64,
    oi: u64,
    expiry: Option<NaiveDate>,
}

pub struct MockGenerator {
    settings: MockSettings,
    underlying: ArcSwap<MockUnderlyingSnapshot>,
    options: Mutex<LruMap<Arc<MockOptionSnapshot>>>,
}

impl MockGenerator {
    pub fn new(settings: MockSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            underlying: ArcSwap::from_pointee(MockUnderlyingSnapshot {
                token: 0,
                symbol: String::new(),
                last: 0.0,
            }),
            options: Mutex::new(LruMap::new()),
        })
    }

    /// Seed the underlying once from a recent close.
    pub fn seed_underlying(&self, token: u32, symbol: &str, close: f64) {
        self.underlying.store(Arc::new(MockUnderlyingSnapshot {
            token,
            symbol: symbol.to_string(),
            last: close,
        }));
        info!(symbol, close, "mock underlying seeded");
    }

    pub fn underlying(&self) -> Arc<MockUnderlyingSnapshot> {
        self.underlying.load_full()
    }

    pub fn option_count(&self) -> usize {
        self.options.lock().len()
    }

    fn walk(&self, price: f64) -> f64 {
        let bps = self.settings.price_var_bps;
        let drift = rand::thread_rng().gen_range(-bps..=bps) / 10_000.0;
        (price * (1.0 + drift)).max(0.05)
    }

    fn volume_noise(&self, volume: u64) -> u64 {
        let pct = self.settings.vol_var_pct;
        let bump = rand::thread_rng().gen_range(0.0..=pct) / 100.0;
        volume + ((volume.max(100) as f64) * bump) as u64
    }

    /// Synthesize the next underlying tick, swapping a fresh immutable
    /// snapshot into place.
    pub fn next_underlying_tick(&self, ts_ms: u64) -> Option<RawTick> {
        let current = self.underlying.load_full();
        if current.last <= 0.0 {
            return None;
        }
        let next = self.walk(current.last);
        self.underlying.store(Arc::new(MockUnderlyingSnapshot {
            token: current.token,
            symbol: current.symbol.clone(),
            last: next,
        }));
        Some(RawTick {
            token: current.token,
            last: next,
            ts_ms,
            bid: None,
            ask: None,
            bid_qty: None,
            ask_qty: None,
            depth: None,
            volume: None,
            last_qty: Some(rand::thread_rng().gen_range(1..=75)),
            oi: None,
            iv: None,
        })
    }

    /// Synthesize the next tick for an option, seeding a snapshot on
    /// first use. Runs eviction before any insert.
    pub fn next_option_tick(&self, instrument: &Instrument, ts_ms: u64) -> RawTick {
        let mut options = self.options.lock();

        let previous = options.get(instrument.token).cloned();
        let snapshot = match previous {
            Some(snapshot) => snapshot,
            None => {
                self.evict_locked(&mut options);
                let seeded = Arc::new(self.seed_option(instrument));
                options.insert(instrument.token, seeded.clone());
                seeded
            }
        };

        let last = self.walk(snapshot.last);
        let volume = self.volume_noise(snapshot.volume);
        let next = Arc::new(MockOptionSnapshot {
            last,
            volume,
            oi: snapshot.oi,
            expiry: snapshot.expiry,
        });
        options.insert(instrument.token, next);
        drop(options);

        let spread = (last * 0.002).max(0.05);
        RawTick {
            token: instrument.token,
            last,
            ts_ms,
            bid: Some((last - spread).max(0.05)),
            ask: Some(last + spread),
            bid_qty: Some(rand::thread_rng().gen_range(1..=20) * instrument.lot_size),
            ask_qty: Some(rand::thread_rng().gen_range(1..=20) * instrument.lot_size),
            depth: None,
            volume: Some(volume),
            last_qty: Some(instrument.lot_size),
            oi: Some(snapshot.oi),
            iv: None,
        }
    }

    /// First snapshot for a contract: synthesized around ATM from the
    /// seeded underlying.
    fn seed_option(&self, instrument: &Instrument) -> MockOptionSnapshot {
        let spot = self.underlying.load().last;
        let strike = instrument.strike.unwrap_or(spot);
        let intrinsic = match instrument.option_type {
            Some(OptionType::Pe) => (strike - spot).max(0.0),
            _ => (spot - strike).max(0.0),
        };
        // Rough time value so far-OTM contracts still move.
        let time_value = (spot * 0.004).max(5.0);
        MockOptionSnapshot {
            last: (intrinsic + time_value).max(0.05),
            volume: rand::thread_rng().gen_range(1_000..50_000),
            oi: rand::thread_rng().gen_range(10_000..500_000),
            expiry: instrument.expiry,
        }
    }

    fn evict_locked(&self, options: &mut LruMap<Arc<MockOptionSnapshot>>) {
        // Expiry sweep first.
        let today = today_in_market_tz();
        let expired: Vec<u32> = options
            .keys()
            .into_iter()
            .filter(|token| {
                options
                    .map
                    .get(token)
                    .map(|&idx| matches!(options.nodes[idx].value.expiry, Some(d) if d < today))
                    .unwrap_or(false)
            })
            .collect();
        for token in expired {
            options.remove(token);
        }

        // LRU trim to leave room for the pending insert.
        while options.len() >= self.settings.max_size {
            if let Some(evicted) = options.pop_lru() {
                debug!(token = evicted, "mock snapshot evicted (lru)");
            } else {
                break;
            }
        }
    }

    /// Drop snapshots for contracts that expired before `today`.
    pub fn sweep_expired(&self, today: NaiveDate) -> usize {
        let mut options = self.options.lock();
        let expired: Vec<u32> = options
            .keys()
            .into_iter()
            .filter(|token| {
                options
                    .map
                    .get(token)
                    .map(|&idx| matches!(options.nodes[idx].value.expiry, Some(d) if d < today))
                    .unwrap_or(false)
            })
            .collect();
        let count = expired.len();
        for token in expired {
            options.remove(token);
        }
        if count > 0 {
            info!(count, "mock expiry sweep removed snapshots");
        }
        count
    }

    /// Periodic cleanup loop running the expiry sweep.
    pub async fn run_cleanup_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired(today_in_market_tz());
                    metrics::gauge!("mock_option_snapshots", self.option_count() as f64);
                }
                _ = cancel.changed() => return Ok(()),
            }
        }
    }
}

pub fn today_in_market_tz() -> NaiveDate {
    chrono::Utc::now()
        .with_timezone(&chrono_tz::Asia::Kolkata)
        .date_naive()
}
