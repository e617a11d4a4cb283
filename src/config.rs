//! Environment-driven configuration.
//!
//! Every subsystem gets its own settings struct with a `from_env()`
//! constructor so defaults live next to the knob they describe. Missing
//! required values abort boot in non-development environments.

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT").unwrap_or_default().as_str() {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// Process-wide environment, set once at boot. Defaults to development so
/// unit tests get verbose errors without any setup.
pub fn environment() -> Environment {
    *ENVIRONMENT.get_or_init(Environment::from_env)
}

pub fn set_environment(env: Environment) {
    let _ = ENVIRONMENT.set(env);
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
    pub shutdown_drain: Duration,
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            allow_origins: env::var("ALLOW_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            shutdown_drain: Duration::from_secs(env_u64("SHUTDOWN_DRAIN_SECS", 30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_instruments_per_conn: usize,
    pub max_conns_per_account: usize,
    pub subscribe_timeout: Duration,
    pub stall_timeout: Duration,
    pub health_interval: Duration,
}

impl PoolSettings {
    pub fn from_env() -> Self {
        Self {
            max_instruments_per_conn: env_usize("MAX_INSTRUMENTS_PER_WS_CONNECTION", 1000),
            max_conns_per_account: env_usize("MAX_WS_CONNECTIONS_PER_ACCOUNT", 3),
            subscribe_timeout: Duration::from_secs(env_u64("WS_SUBSCRIBE_TIMEOUT_SECS", 10)),
            stall_timeout: Duration::from_secs(env_u64("WS_STALL_TIMEOUT_SECS", 30)),
            health_interval: Duration::from_secs(env_u64("WS_HEALTH_INTERVAL_SECS", 5)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_enabled: bool,
    pub batch_window: Duration,
    pub batch_max_size: usize,
    pub interest_rate: f64,
    pub dividend_yield: f64,
    pub mock_enabled: bool,
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        Self {
            batch_enabled: env_bool("TICK_BATCH_ENABLED", true),
            batch_window: Duration::from_millis(env_u64("TICK_BATCH_WINDOW_MS", 100)),
            batch_max_size: env_usize("TICK_BATCH_MAX_SIZE", 1000),
            interest_rate: env_f64("OPTION_GREEKS_INTEREST_RATE", 0.10),
            dividend_yield: env_f64("OPTION_GREEKS_DIVIDEND_YIELD", 0.0),
            mock_enabled: env_bool("MOCK_DATA_ENABLED", false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BarSettings {
    pub interval: Duration,
}

impl BarSettings {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(env_u64("STREAM_INTERVAL_SECONDS", 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockSettings {
    pub max_size: usize,
    pub cleanup_interval: Duration,
    pub price_var_bps: f64,
    pub vol_var_pct: f64,
}

impl MockSettings {
    pub fn from_env() -> Self {
        Self {
            max_size: env_usize("MOCK_STATE_MAX_SIZE", 5000),
            cleanup_interval: Duration::from_secs(env_u64(
                "MOCK_STATE_CLEANUP_INTERVAL_SECONDS",
                300,
            )),
            price_var_bps: env_f64("MOCK_PRICE_VAR_BPS", 25.0),
            vol_var_pct: env_f64("MOCK_VOL_VAR_PCT", 5.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub retention: Duration,
    pub poll_interval: Duration,
}

impl OrderSettings {
    pub fn from_env() -> Self {
        // Backoff floors/caps per the retry contract: base >= 0.5s, cap <= 60s.
        let base_ms = env_u64("ORDER_BASE_BACKOFF_MS", 1_000).max(500);
        let max_ms = env_u64("ORDER_MAX_BACKOFF_MS", 30_000).min(60_000);
        Self {
            workers: env_usize("ORDER_WORKERS", 4),
            max_attempts: env_u64("ORDER_MAX_ATTEMPTS", 5) as u32,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(max_ms),
            retention: Duration::from_secs(env_u64("ORDER_TASK_RETENTION_SECS", 86_400)),
            poll_interval: Duration::from_millis(env_u64("ORDER_POLL_INTERVAL_MS", 200)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub redis_url: Option<String>,
    pub publish_retries: u32,
    pub retry_backoff: Duration,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl BusSettings {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            publish_retries: env_u64("BUS_PUBLISH_RETRIES", 2) as u32,
            retry_backoff: Duration::from_millis(env_u64("BUS_RETRY_BACKOFF_MS", 50)),
            failure_threshold: env_u64("BUS_BREAKER_FAILURE_THRESHOLD", 5) as u32,
            recovery_timeout: Duration::from_secs(env_u64("BUS_BREAKER_RECOVERY_SECS", 15)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub debounce: Duration,
    pub min_interval: Duration,
    pub soft_budget: Duration,
}

impl ReconcilerSettings {
    pub fn from_env() -> Self {
        Self {
            debounce: Duration::from_millis(env_u64("RECONCILE_DEBOUNCE_MS", 500)),
            min_interval: Duration::from_millis(env_u64("RECONCILE_MIN_INTERVAL_MS", 2_000)),
            soft_budget: Duration::from_secs(env_u64("RECONCILE_SOFT_BUDGET_SECS", 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub client_buffer: usize,
    pub max_consecutive_drops: u32,
}

impl HubSettings {
    pub fn from_env() -> Self {
        Self {
            client_buffer: env_usize("CLIENT_OUTBOUND_BUFFER", 256),
            max_consecutive_drops: env_u64("CLIENT_MAX_CONSECUTIVE_DROPS", 50) as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub db_path: String,
    pub credential_master_key: Option<String>,
    pub jwt_secret: String,
}

impl StoreSettings {
    pub fn from_env(environment: Environment) -> Result<Self> {
        let db_path = env::var("INSTRUMENT_DB_PATH").unwrap_or_else(|_| "optikka.db".to_string());

        let credential_master_key = env::var("CREDENTIAL_MASTER_KEY").ok();
        if credential_master_key.is_none() && !environment.is_development() {
            bail!("CREDENTIAL_MASTER_KEY is required outside development");
        }

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(s) => s,
            Err(_) if environment.is_development() => {
                "dev-secret-change-in-production-minimum-32-characters".to_string()
            }
            Err(_) => bail!("JWT_SECRET is required outside development"),
        };

        Ok(Self {
            db_path,
            credential_master_key,
            jwt_secret,
        })
    }
}

/// Aggregated boot-time settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub server: ServerSettings,
    pub pool: PoolSettings,
    pub pipeline: PipelineSettings,
    pub bars: BarSettings,
    pub mock: MockSettings,
    pub orders: OrderSettings,
    pub bus: BusSettings,
    pub reconciler: ReconcilerSettings,
    pub hub: HubSettings,
    pub store: StoreSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_env();
        let store = StoreSettings::from_env(environment).context("store settings")?;
        Ok(Self {
            environment,
            server: ServerSettings::from_env(),
            pool: PoolSettings::from_env(),
            pipeline: PipelineSettings::from_env(),
            bars: BarSettings::from_env(),
            mock: MockSettings::from_env(),
            orders: OrderSettings::from_env(),
            bus: BusSettings::from_env(),
            reconciler: ReconcilerSettings::from_env(),
            hub: HubSettings::from_env(),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_backoff_clamped() {
        std::env::set_var("ORDER_BASE_BACKOFF_MS", "10");
        std::env::set_var("ORDER_MAX_BACKOFF_MS", "600000");
        let settings = OrderSettings::from_env();
        assert_eq!(settings.base_backoff, Duration::from_millis(500));
        assert_eq!(settings.max_backoff, Duration::from_millis(60_000));
        std::env::remove_var("ORDER_BASE_BACKOFF_MS");
        std::env::remove_var("ORDER_MAX_BACKOFF_MS");
    }

    #[test]
    fn test_defaults_without_env() {
        let pool = PoolSettings::from_env();
        assert_eq!(pool.max_instruments_per_conn, 1000);
        assert_eq!(pool.max_conns_per_account, 3);

        let mock = MockSettings::from_env();
        assert_eq!(mock.max_size, 5000);
        assert_eq!(mock.cleanup_interval, Duration::from_secs(300));
    }
}
