//! End-to-end dataflow: raw ticks through validation, enrichment and the
//! bus, out to a subscribed hub client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use optikka_backend::auth::RevocationRegistry;
use optikka_backend::bus::{BusTransport, MemoryBus, Publisher};
use optikka_backend::config::{BusSettings, HubSettings, MockSettings, PipelineSettings};
use optikka_backend::hub::ClientHub;
use optikka_backend::models::{Instrument, OptionType, RawTick, Segment};
use optikka_backend::pipeline::{BarAggregator, MockGenerator, TickPipeline};
use optikka_backend::registry::InstrumentRegistry;

const NIFTY_TOKEN: u32 = 256_265;
const OPTION_TOKEN: u32 = 1_001;

fn instruments() -> Vec<Instrument> {
    vec![
        Instrument {
            token: NIFTY_TOKEN,
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
            token: OPTION_TOKEN,
            symbol: "NIFTY25AUG24000CE".into(),
            segment: Segment::Opt,
            option_type: Some(OptionType::Ce),
            strike: Some(24_000.0),
            expiry: Some((Utc::now() + chrono::Duration::days(30)).date_naive()),
            lot_size: 50,
            tick_size: 0.05,
            underlying_token: Some(NIFTY_TOKEN),
        },
    ]
}

fn tick(token: u32, last: f64) -> RawTick {
    RawTick {
        token,
        last,
        ts_ms: Utc::now().timestamp_millis() as u64,
        bid: Some(last - 0.5),
        ask: Some(last + 0.5),
        bid_qty: Some(100),
        ask_qty: Some(100),
        depth: None,
        volume: Some(10_000),
        last_qty: Some(50),
        oi: Some(100_000),
        iv: None,
    }
}

#[tokio::test]
async fn tick_reaches_subscribed_client_with_greeks() {
    let transport = Arc::new(MemoryBus::new(256));
    let publisher = Arc::new(Publisher::new(
        transport.clone(),
        &BusSettings {
            redis_url: None,
            publish_retries: 1,
            retry_backoff: Duration::from_millis(1),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(1),
        },
    ));

    let registry = Arc::new(InstrumentRegistry::new());
    registry.replace(instruments());

    let bars = BarAggregator::new(60, publisher.clone());
    let mock = MockGenerator::new(MockSettings {
        max_size: 100,
        cleanup_interval: Duration::from_secs(300),
        price_var_bps: 25.0,
        vol_var_pct: 5.0,
    });
    let pipeline = TickPipeline::new(
        registry.clone(),
        publisher.clone(),
        bars,
        mock,
        PipelineSettings {
            batch_enabled: false,
            batch_window: Duration::from_millis(20),
            batch_max_size: 100,
            interest_rate: 0.10,
            dividend_yield: 0.0,
            mock_enabled: false,
        },
    );

    let hub = ClientHub::new(
        HubSettings {
            client_buffer: 32,
            max_consecutive_drops: 10,
        },
        Arc::new(RevocationRegistry::new()),
    );
    hub.index_underlyings(registry.index_symbols());

    // Hub reader consumes the bus like production wiring.
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(hub.clone().run_bus_reader(transport.subscribe(), cancel_rx));

    // A client subscribed to the option token.
    let (conn_id, mut client_rx) = hub.register("user-1", "hash-1");
    hub.subscribe_tokens(conn_id, &[OPTION_TOKEN]);

    // Spot first, then the option print.
    pipeline
        .process_ticks("A1", vec![tick(NIFTY_TOKEN, 24_000.0)], false)
        .await;
    pipeline
        .process_ticks("A1", vec![tick(OPTION_TOKEN, 350.0)], false)
        .await;

    let frame = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
        .await
        .expect("frame delivered")
        .expect("client open");
    let axum::extract::ws::Message::Text(text) = frame else {
        panic!("expected text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "tick");
    assert_eq!(value["topic"], "ticker:nifty:options");
    assert_eq!(value["data"]["token"], OPTION_TOKEN);
    assert!(value["data"]["iv"].as_f64().unwrap() > 0.0);
    assert!(value["data"]["delta"].as_f64().unwrap() > 0.0);
}
