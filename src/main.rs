//! Optikka - Options market-data streaming gateway
//!
//! Boot order: configuration -> tracing/metrics -> stores -> instrument
//! registry -> session orchestrator -> connection pool -> mock state ->
//! tick pipeline -> bar aggregator -> client hub -> order engine ->
//! reconciler -> HTTP/WS server. Shutdown drains in reverse under a
//! bounded deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use optikka_backend::api::{routes::build_router, ApiState};
use optikka_backend::auth::{JwtHandler, RevocationRegistry};
use optikka_backend::bus::{BusTransport, MemoryBus, Publisher, RedisBus};
use optikka_backend::config::Settings;
use optikka_backend::hub::ClientHub;
use optikka_backend::middleware::{build_cors_layer, https_redirect, request_logging};
use optikka_backend::orders::{OrderEngine, OrderEngineHandle};
use optikka_backend::pipeline::{BarAggregator, MockGenerator, TickPipeline};
use optikka_backend::reconciler::Reconciler;
use optikka_backend::registry::InstrumentRegistry;
use optikka_backend::reliability::{BreakerConfig, Supervisor};
use optikka_backend::store::{
    AccountStore, CredentialCipher, OrderTaskStore, SubscriptionStore,
};
use optikka_backend::upstream::rest::RestBrokerFactory;
use optikka_backend::upstream::ws_feed::VendorWsFeed;
use optikka_backend::upstream::{ConnectionPool, SessionOrchestrator, TickBatch};

#[derive(Parser, Debug)]
#[command(name = "optikka", about = "Options market-data streaming gateway")]
struct Args {
    /// Override the configured bind port
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing();

    let mut settings = Settings::from_env().context("load configuration")?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    optikka_backend::config::set_environment(settings.environment);
    let settings = Arc::new(settings);

    info!(environment = ?settings.environment, "🚀 optikka gateway starting");

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;

    // Persistent stores share one sqlite database.
    let db_path = settings.store.db_path.clone();
    let subscriptions = Arc::new(SubscriptionStore::new(&db_path)?);
    let cipher = CredentialCipher::new(settings.store.credential_master_key.as_deref())?;
    let accounts = Arc::new(AccountStore::new(&db_path, cipher)?);
    let order_store = Arc::new(OrderTaskStore::new(&db_path)?);

    let registry = Arc::new(InstrumentRegistry::new());
    match registry.load_from_store(&subscriptions) {
        Ok(0) => warn!("instrument master is empty; run /admin/instrument-refresh after seeding"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "instrument load failed; continuing with empty registry"),
    }

    let sessions = Arc::new(SessionOrchestrator::new(
        accounts.load_all().context("load trading accounts")?,
        Arc::new(RestBrokerFactory::from_env()),
        account_breaker_config(),
    ));

    // Pub/sub bus: Redis when configured, in-process broadcast otherwise.
    let transport: Arc<dyn BusTransport> = match settings.bus.redis_url.as_deref() {
        Some(url) => Arc::new(RedisBus::connect(url).await.context("connect redis bus")?),
        None => {
            info!("REDIS_URL not set; using in-process bus");
            Arc::new(MemoryBus::default())
        }
    };
    let publisher = Arc::new(Publisher::new(transport, &settings.bus));

    // Streaming pool feeding the pipeline.
    let (tick_tx, tick_rx) = mpsc::channel::<TickBatch>(4096);
    let feed_factory = Arc::new(VendorWsFeed::new(sessions.clone()));
    let pool = ConnectionPool::new(settings.pool.clone(), feed_factory, tick_tx);

    let mock = MockGenerator::new(settings.mock.clone());
    let bars = BarAggregator::new(settings.bars.interval.as_secs(), publisher.clone());
    let pipeline = TickPipeline::new(
        registry.clone(),
        publisher.clone(),
        bars.clone(),
        mock.clone(),
        settings.pipeline.clone(),
    );

    let revocations = Arc::new(RevocationRegistry::new());
    let jwt = Arc::new(JwtHandler::new(settings.store.jwt_secret.clone()));
    let hub = ClientHub::new(settings.hub.clone(), revocations.clone());
    hub.index_underlyings(registry.index_symbols());

    let orders = OrderEngine::new(order_store, sessions.clone(), settings.orders.clone());

    let reconciler = Reconciler::new(
        subscriptions.clone(),
        sessions.clone(),
        pool.clone(),
        settings.reconciler.clone(),
    );
    reconciler.start();

    // Every long-lived unit runs under the supervisor.
    let supervisor = Supervisor::new();
    supervisor.spawn("pool_health", pool.clone().run_health_loop(supervisor.cancel_signal()));
    supervisor.spawn(
        "tick_pipeline",
        pipeline.clone().run(tick_rx, supervisor.cancel_signal()),
    );
    supervisor.spawn("bar_timer", bars.clone().run_timer(supervisor.cancel_signal()));
    supervisor.spawn(
        "mock_cleanup",
        mock.clone().run_cleanup_loop(supervisor.cancel_signal()),
    );
    supervisor.spawn(
        "hub_reader",
        hub.clone()
            .run_bus_reader(publisher.subscribe(), supervisor.cancel_signal()),
    );
    for worker_id in 0..settings.orders.workers {
        supervisor.spawn(
            &format!("order_worker_{worker_id}"),
            orders.clone().run_worker(worker_id, supervisor.cancel_signal()),
        );
    }
    supervisor.spawn("order_cleanup", orders.clone().run_cleanup(supervisor.cancel_signal()));

    if settings.pipeline.mock_enabled {
        // Optional explicit seed so mocking works before any live session
        // has populated the spot cache.
        if let Some(close) = std::env::var("MOCK_UNDERLYING_CLOSE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            if let Some((token, symbol)) = registry.index_symbols().into_iter().next() {
                mock.seed_underlying(token, &symbol, close);
            }
        }
        let mock_subscriptions = subscriptions.clone();
        let provider = Arc::new(move || {
            mock_subscriptions
                .load_desired()
                .map(|desired| {
                    desired
                        .into_values()
                        .map(|(inst, _)| Arc::new(inst))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        supervisor.spawn(
            "mock_ticker",
            pipeline.clone().run_mock_loop(provider, supervisor.cancel_signal()),
        );
    }

    // Daily instrument refresh.
    {
        let refresh_registry = registry.clone();
        let refresh_store = subscriptions.clone();
        let refresh_hub = hub.clone();
        let refresh_reconciler = reconciler.clone();
        let mut cancel = supervisor.cancel_signal();
        supervisor.spawn("instrument_refresh", async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.changed() => return Ok(()),
                }
                match refresh_registry.load_from_store(&refresh_store) {
                    Ok(count) => {
                        info!(instruments = count, "daily instrument refresh");
                        refresh_hub.index_underlyings(refresh_registry.index_symbols());
                        refresh_reconciler.trigger();
                    }
                    Err(e) => warn!(error = %e, "daily instrument refresh failed"),
                }
            }
        });
    }

    // Initial reconcile converges the pool onto the persisted desired set.
    reconciler.trigger();

    let state = ApiState {
        settings: settings.clone(),
        subscriptions,
        registry,
        sessions,
        pool: pool.clone(),
        pipeline: pipeline.clone(),
        reconciler,
        orders: OrderEngineHandle(orders.clone()),
        hub,
        publisher,
        jwt,
        revocations,
        prometheus,
    };

    let app = build_router(state)
        .layer(build_cors_layer(
            settings.environment,
            &settings.server.allow_origins,
        ))
        .layer(axum::middleware::from_fn(https_redirect))
        .layer(axum::middleware::from_fn(request_logging));

    let addr = format!("{}:{}", settings.server.bind_addr, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "🎯 api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain: new clients are already refused; flush the batcher, stop
    // the background units, close upstream connections, wait for order
    // workers to go quiet.
    info!("shutting down, draining");
    if let Some(batcher) = pipeline.batcher() {
        batcher.flush().await;
    }
    supervisor.shutdown(settings.server.shutdown_drain).await;
    pool.shutdown().await;

    let drain_deadline = tokio::time::Instant::now() + settings.server.shutdown_drain;
    while !orders.is_quiescent() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("✅ shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn account_breaker_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: std::env::var("ACCOUNT_BREAKER_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3),
        recovery_timeout: Duration::from_secs(
            std::env::var("ACCOUNT_BREAKER_RECOVERY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        ),
        half_open_max_attempts: 3,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "optikka_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
