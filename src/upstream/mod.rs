//! Upstream broker integration.
//!
//! The vendor protocol is consumed through two seams: [`MarketFeedFactory`]
//! / [`MarketConnection`] for streaming market data and [`BrokerApi`] for
//! order placement and historical queries. Production wiring uses the
//! JSON-over-WebSocket feed in [`ws_feed`] and the REST client in
//! [`rest`]; tests substitute in-memory doubles.

pub mod pool;
pub mod rest;
pub mod session;
pub mod ws_feed;

pub use pool::{ConnectionPool, PoolStats};
pub use session::SessionOrchestrator;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GatewayResult;
use crate::models::{Candle, RawTick, SubscribeMode};

/// Batch of raw ticks attributed to the account whose connection
/// received them.
#[derive(Debug, Clone)]
pub struct TickBatch {
    pub account_id: String,
    pub ticks: Vec<RawTick>,
}

/// Lifecycle and data events surfaced by a market connection.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Connected,
    Ticks(Vec<RawTick>),
    Disconnected { reason: String },
    Error(String),
}

/// Callback invoked by the feed for every event on one connection.
pub type FeedEventHandler = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// One live upstream streaming connection.
#[async_trait]
pub trait MarketConnection: Send + Sync {
    async fn subscribe(&self, tokens: &[u32], mode: SubscribeMode) -> GatewayResult<()>;
    async fn unsubscribe(&self, tokens: &[u32]) -> GatewayResult<()>;
    async fn close(&self);
}

/// Creates market connections for an account. Credentials are resolved
/// internally from the session orchestrator.
#[async_trait]
pub trait MarketFeedFactory: Send + Sync {
    async fn connect(
        &self,
        account_id: &str,
        handler: FeedEventHandler,
    ) -> GatewayResult<Arc<dyn MarketConnection>>;
}

/// Broker order/quote/history REST surface.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn place_order(&self, params: &serde_json::Value) -> GatewayResult<serde_json::Value>;
    async fn modify_order(
        &self,
        order_id: &str,
        params: &serde_json::Value,
    ) -> GatewayResult<serde_json::Value>;
    async fn cancel_order(&self, order_id: &str) -> GatewayResult<serde_json::Value>;
    async fn get_quote(&self, tokens: &[u32]) -> GatewayResult<serde_json::Value>;
    async fn historical_candles(
        &self,
        token: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
        with_oi: bool,
    ) -> GatewayResult<Vec<Candle>>;
}
