//! Tick validation, enrichment and publication.
//!
//! Per inbound batch: validate (bad ticks are dropped and counted, never
//! abort the batch), resolve instrument metadata, split option/underlying,
//! enrich options with IV and Greeks against the last-seen underlying
//! spot, then publish per class topic. Large batches enrich in parallel;
//! the math is pure so only the spot map read is shared.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use parking_lot::RwLock;
use rayon::prelude::*;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bus::{futures_topic, options_topic, BatchingPublisher, Publisher};
use crate::config::PipelineSettings;
use crate::greeks;
use crate::models::{Instrument, OptionSnapshot, OptionType, RawTick, Segment};
use crate::pipeline::{BarAggregator, MockGenerator};
use crate::registry::InstrumentRegistry;
use crate::upstream::TickBatch;

/// Batches at or above this size enrich on the rayon pool.
const PARALLEL_THRESHOLD: usize = 64;

/// Expiry cutoff in the market timezone (15:30 IST).
const EXPIRY_HOUR: u32 = 15;
const EXPIRY_MINUTE: u32 = 30;

pub struct TickPipeline {
    registry: Arc<InstrumentRegistry>,
    publisher: Arc<Publisher>,
    batcher: Option<Arc<BatchingPublisher>>,
    bars: Arc<BarAggregator>,
    mock: Arc<MockGenerator>,
    settings: PipelineSettings,
    /// Last seen spot per underlying token.
    spots: RwLock<HashMap<u32, f64>>,
}

impl TickPipeline {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        publisher: Arc<Publisher>,
        bars: Arc<BarAggregator>,
        mock: Arc<MockGenerator>,
        settings: PipelineSettings,
    ) -> Arc<Self> {
        let batcher = settings.batch_enabled.then(|| {
            BatchingPublisher::new(publisher.clone(), settings.batch_max_size, settings.batch_window)
        });
        Arc::new(Self {
            registry,
            publisher,
            batcher,
            bars,
            mock,
            settings,
            spots: RwLock::new(HashMap::new()),
        })
    }

    pub fn spot(&self, underlying_token: u32) -> Option<f64> {
        self.spots.read().get(&underlying_token).copied()
    }

    pub fn batcher(&self) -> Option<Arc<BatchingPublisher>> {
        self.batcher.clone()
    }

    /// Main intake loop fed by the connection pool.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TickBatch>,
        mut cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                batch = rx.recv() => {
                    let Some(batch) = batch else { return Ok(()) };
                    self.process_ticks(&batch.account_id, batch.ticks, false).await;
                }
                _ = cancel.changed() => return Ok(()),
            }
        }
    }

    pub async fn process_ticks(&self, account_id: &str, ticks: Vec<RawTick>, is_mock: bool) {
        let mut options: Vec<(Arc<Instrument>, RawTick)> = Vec::new();
        let mut underlying: Vec<(Arc<Instrument>, RawTick)> = Vec::new();

        for tick in ticks {
            if let Err(reason) = validate_tick(&tick) {
                metrics::increment_counter!("ticks_rejected", "reason" => reason);
                continue;
            }
            let Some(instrument) = self.registry.get(tick.token) else {
                metrics::increment_counter!("ticks_rejected", "reason" => "unknown_token");
                continue;
            };
            match instrument.segment {
                Segment::Idx => underlying.push((instrument, tick)),
                Segment::Opt | Segment::Fut | Segment::Eq => options.push((instrument, tick)),
            }
        }

        // Underlying first so options in the same batch see fresh spots.
        for (instrument, tick) in &underlying {
            self.spots.write().insert(instrument.token, tick.last);
            self.bars
                .on_tick(
                    account_id,
                    &instrument.symbol,
                    tick.last,
                    tick.last_qty.unwrap_or(0) as u64,
                    tick.ts_ms,
                    is_mock,
                )
                .await;
        }

        if options.is_empty() {
            return;
        }

        let now = Utc::now();
        let snapshots: Vec<(String, OptionSnapshot)> = if options.len() >= PARALLEL_THRESHOLD {
            let spots = self.spots.read().clone();
            options
                .par_iter()
                .filter_map(|(inst, tick)| self.enrich_with(inst, tick, &spots, now, is_mock))
                .collect()
        } else {
            let spots = self.spots.read().clone();
            options
                .iter()
                .filter_map(|(inst, tick)| self.enrich_with(inst, tick, &spots, now, is_mock))
                .collect()
        };

        for (topic, snapshot) in snapshots {
            metrics::increment_counter!("snapshots_published", "topic" => topic.clone());
            match &self.batcher {
                Some(batcher) => match serde_json::to_value(&snapshot) {
                    Ok(value) => batcher.push(&topic, value).await,
                    Err(e) => warn!(error = %e, "snapshot serialization failed"),
                },
                None => match serde_json::to_vec(&snapshot) {
                    Ok(payload) => self.publisher.publish(&topic, payload).await,
                    Err(e) => warn!(error = %e, "snapshot serialization failed"),
                },
            }
        }
    }

    /// Enrich one option/future tick into its published snapshot. Any
    /// degenerate input drops the single tick, never the batch.
    fn enrich_with(
        &self,
        instrument: &Instrument,
        tick: &RawTick,
        spots: &HashMap<u32, f64>,
        now: DateTime<Utc>,
        is_mock: bool,
    ) -> Option<(String, OptionSnapshot)> {
        let class = instrument.class();
        let topic = match instrument.segment {
            Segment::Opt => options_topic(&class),
            _ => futures_topic(&class),
        };

        let mut snapshot = OptionSnapshot {
            token: tick.token,
            symbol: instrument.symbol.clone(),
            last: tick.last,
            bid: tick.bid,
            ask: tick.ask,
            bid_qty: tick.bid_qty,
            ask_qty: tick.ask_qty,
            depth: tick.depth.clone(),
            volume: tick.volume.unwrap_or(0),
            oi: tick.oi.unwrap_or(0),
            iv: 0.0,
            delta: 0.0,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            ts_ms: tick.ts_ms,
            is_mock,
            analytics_stale: false,
        };

        if instrument.segment != Segment::Opt {
            return Some((topic, snapshot));
        }

        let (Some(option_type), Some(strike), Some(expiry)) =
            (instrument.option_type, instrument.strike, instrument.expiry)
        else {
            metrics::increment_counter!("enrich_failures", "reason" => "incomplete_metadata");
            return None;
        };

        let spot = instrument
            .underlying_token
            .and_then(|token| spots.get(&token).copied());
        let Some(spot) = spot else {
            // Publish raw quote with zeroed analytics rather than hold
            // the tick hostage to the spot feed.
            snapshot.analytics_stale = true;
            metrics::increment_counter!("enrich_failures", "reason" => "missing_spot");
            return Some((topic, snapshot));
        };

        let t = time_to_expiry(expiry, now);
        let rate = self.settings.interest_rate;
        let div_yield = self.settings.dividend_yield;

        let sigma = match tick.iv.filter(|iv| iv.is_finite() && *iv > 0.0) {
            Some(iv) => iv,
            None => {
                match greeks::implied_vol(tick.last, spot, strike, t, rate, div_yield, option_type)
                {
                    Some(iv) => iv,
                    None => {
                        debug!(token = tick.token, "implied vol not bracketed, reporting 0");
                        0.0
                    }
                }
            }
        };

        if sigma > 0.0 {
            snapshot.iv = sigma;
            snapshot.delta = greeks::delta(spot, strike, t, sigma, rate, div_yield, option_type);
            snapshot.gamma = greeks::gamma(spot, strike, t, sigma, rate, div_yield);
            snapshot.theta = greeks::theta(spot, strike, t, sigma, rate, div_yield, option_type);
            snapshot.vega = greeks::vega(spot, strike, t, sigma, rate, div_yield);
        }

        Some((topic, snapshot))
    }

    /// Out-of-hours generator: when the market is closed and mocking is
    /// enabled, draws synthetic ticks from the mock state and feeds them
    /// through the normal enrichment path.
    pub async fn run_mock_loop(
        self: Arc<Self>,
        instruments: Arc<dyn Fn() -> Vec<Arc<Instrument>> + Send + Sync>,
        mut cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return Ok(()),
            }
            if !self.settings.mock_enabled || market_open_now() {
                continue;
            }

            if self.mock.underlying().last <= 0.0 {
                // Seed from the most recent session's spot; without one
                // there is nothing sane to synthesize from yet.
                let seed = self
                    .registry
                    .index_symbols()
                    .into_iter()
                    .find_map(|(token, symbol)| self.spot(token).map(|close| (token, symbol, close)));
                match seed {
                    Some((token, symbol, close)) => self.mock.seed_underlying(token, &symbol, close),
                    None => continue,
                }
            }

            let ts_ms = Utc::now().timestamp_millis() as u64;
            let mut ticks: Vec<RawTick> = Vec::new();
            if let Some(tick) = self.mock.next_underlying_tick(ts_ms) {
                ticks.push(tick);
            }
            for instrument in instruments() {
                if instrument.segment == Segment::Opt {
                    ticks.push(self.mock.next_option_tick(&instrument, ts_ms));
                }
            }
            if !ticks.is_empty() {
                self.process_ticks("mock", ticks, true).await;
            }
        }
    }
}

fn validate_tick(tick: &RawTick) -> Result<(), &'static str> {
    if tick.token == 0 {
        return Err("missing_token");
    }
    if !tick.last.is_finite() {
        return Err("non_finite_price");
    }
    if tick.last < 0.0 {
        return Err("negative_price");
    }
    if tick.ts_ms == 0 {
        return Err("missing_timestamp");
    }
    for quote in [tick.bid, tick.ask] {
        if let Some(q) = quote {
            if !q.is_finite() || q < 0.0 {
                return Err("bad_quote");
            }
        }
    }
    Ok(())
}

/// Years to expiry, measured to 15:30 IST on the expiry date. Clamped at
/// zero so same-day post-cutoff ticks price at intrinsic.
pub fn time_to_expiry(expiry: NaiveDate, now: DateTime<Utc>) -> f64 {
    let cutoff = expiry
        .and_hms_opt(EXPIRY_HOUR, EXPIRY_MINUTE, 0)
        .expect("static time of day");
    let expiry_utc = match Kolkata.from_local_datetime(&cutoff) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        _ => Utc.from_utc_datetime(&cutoff),
    };
    let seconds = (expiry_utc - now).num_seconds();
    (seconds.max(0) as f64) / (365.0 * 86_400.0)
}

/// NSE hours: 09:15-15:30 IST, Monday through Friday.
pub fn market_open_now() -> bool {
    let now = Utc::now().with_timezone(&Kolkata);
    use chrono::{Datelike, Timelike, Weekday};
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = now.hour() * 60 + now.minute();
    (9 * 60 + 15..=15 * 60 + 30).contains(&minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, BusTransport, MemoryBus};
    use crate::config::{BusSettings, MockSettings};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn pipeline(batch: bool) -> (Arc<TickPipeline>, broadcast::Receiver<BusMessage>) {
        let transport = Arc::new(MemoryBus::new(256));
        let bus_rx = transport.subscribe();
        let publisher = Arc::new(Publisher::new(
            transport,
            &BusSettings {
                redis_url: None,
                publish_retries: 0,
                retry_backoff: Duration::from_millis(1),
                failure_threshold: 5,
                recovery_timeout: Duration::from_millis(100),
            },
        ));
        let bars = BarAggregator::new(60, publisher.clone());
        let mock = MockGenerator::new(MockSettings {
            max_size: 100,
            cleanup_interval: Duration::from_secs(300),
            price_var_bps: 25.0,
            vol_var_pct: 5.0,
        });

        let registry = Arc::new(InstrumentRegistry::new());
        registry.replace(vec![
            Instrument {
                token: 256_265,
                symbol: "NIFTY 50".into(),
                segment: Segment::Idx,
                option_type: None,
                strike: None,
                expiry: None,
                lot_size: 1,
                tick_size: 0.05,
                underlying_token: None,
            },
            Instrument {
                token: 1001,
                symbol: "NIFTY25AUG24000CE".into(),
                segment: Segment::Opt,
                option_type: Some(OptionType::Ce),
                strike: Some(24_000.0),
                expiry: Some(far_expiry()),
                lot_size: 50,
                tick_size: 0.05,
                underlying_token: Some(256_265),
            },
        ]);

        let settings = PipelineSettings {
            batch_enabled: batch,
            batch_window: Duration::from_millis(20),
            batch_max_size: 10,
            interest_rate: 0.10,
            dividend_yield: 0.0,
            mock_enabled: false,
        };
        (
            TickPipeline::new(registry, publisher, bars, mock, settings),
            bus_rx,
        )
    }

    fn far_expiry() -> NaiveDate {
        (Utc::now() + chrono::Duration::days(30)).date_naive()
    }

    fn tick(token: u32, last: f64) -> RawTick {
        RawTick {
            token,
            last,
            ts_ms: Utc::now().timestamp_millis() as u64,
            bid: None,
            ask: None,
            bid_qty: None,
            ask_qty: None,
            depth: None,
            volume: Some(1_000),
            last_qty: Some(50),
            oi: Some(10_000),
            iv: None,
        }
    }

    #[test]
    fn test_validation_rejects_degenerate_ticks() {
        assert!(validate_tick(&tick(1, 100.0)).is_ok());
        assert_eq!(validate_tick(&tick(0, 100.0)), Err("missing_token"));
        assert_eq!(validate_tick(&tick(1, f64::NAN)), Err("non_finite_price"));
        assert_eq!(
            validate_tick(&tick(1, f64::INFINITY)),
            Err("non_finite_price")
        );
        assert_eq!(validate_tick(&tick(1, -1.0)), Err("negative_price"));

        let mut bad_quote = tick(1, 100.0);
        bad_quote.bid = Some(f64::NAN);
        assert_eq!(validate_tick(&bad_quote), Err("bad_quote"));
    }

    #[tokio::test]
    async fn test_option_enriched_with_greeks_when_spot_known() {
        let (pipeline, mut bus_rx) = pipeline(false);

        // Spot first, then the option tick in the same batch.
        let atm_price = 350.0;
        pipeline
            .process_ticks("A", vec![tick(256_265, 24_000.0), tick(1001, atm_price)], false)
            .await;

        let msg = bus_rx.recv().await.unwrap();
        assert_eq!(msg.topic, "ticker:nifty:options");
        let snap: OptionSnapshot = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(snap.token, 1001);
        assert!(snap.iv > 0.0, "iv derived from price");
        assert!(snap.delta > 0.0 && snap.delta <= 1.0);
        assert!(snap.gamma >= 0.0);
        assert!(snap.theta <= 0.0);
        assert!(snap.vega >= 0.0);
        assert!(!snap.analytics_stale);
    }

    #[tokio::test]
    async fn test_option_without_spot_is_published_stale() {
        let (pipeline, mut bus_rx) = pipeline(false);
        pipeline.process_ticks("A", vec![tick(1001, 350.0)], false).await;

        let msg = bus_rx.recv().await.unwrap();
        let snap: OptionSnapshot = serde_json::from_slice(&msg.payload).unwrap();
        assert!(snap.analytics_stale);
        assert_eq!(snap.iv, 0.0);
        assert_eq!(snap.delta, 0.0);
    }

    #[tokio::test]
    async fn test_bad_tick_does_not_abort_batch() {
        let (pipeline, mut bus_rx) = pipeline(false);
        let mut nan_tick = tick(1001, f64::NAN);
        nan_tick.ts_ms = 1;
        pipeline
            .process_ticks(
                "A",
                vec![tick(256_265, 24_000.0), nan_tick, tick(1001, 350.0)],
                false,
            )
            .await;

        let msg = bus_rx.recv().await.unwrap();
        let snap: OptionSnapshot = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(snap.token, 1001);
    }

    #[tokio::test]
    async fn test_unknown_token_dropped() {
        let (pipeline, mut bus_rx) = pipeline(false);
        pipeline.process_ticks("A", vec![tick(4242, 10.0)], false).await;
        // Nothing published.
        assert!(tokio::time::timeout(Duration::from_millis(50), bus_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_batched_mode_emits_json_arrays() {
        let (pipeline, mut bus_rx) = pipeline(true);
        pipeline
            .process_ticks("A", vec![tick(256_265, 24_000.0), tick(1001, 350.0)], false)
            .await;

        let msg = tokio::time::timeout(Duration::from_millis(500), bus_rx.recv())
            .await
            .expect("batch flush")
            .unwrap();
        let items: Vec<OptionSnapshot> = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].token, 1001);
    }

    #[test]
    fn test_time_to_expiry_clamps_at_zero() {
        let past = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_eq!(time_to_expiry(past, Utc::now()), 0.0);

        let future = (Utc::now() + chrono::Duration::days(365)).date_naive();
        let t = time_to_expiry(future, Utc::now());
        assert!((0.9..=1.1).contains(&t));
    }

    #[tokio::test]
    async fn test_spot_cache_updates_from_underlying() {
        let (pipeline, _bus_rx) = pipeline(false);
        assert!(pipeline.spot(256_265).is_none());
        pipeline.process_ticks("A", vec![tick(256_265, 24_123.0)], false).await;
        assert_eq!(pipeline.spot(256_265), Some(24_123.0));
    }
}
