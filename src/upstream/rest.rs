//! Broker REST API client.
//!
//! Thin JSON client over the vendor's order and history endpoints.
//! Failures map onto the gateway error taxonomy by HTTP status so the
//! order engine can decide retry vs. fail without knowing HTTP.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;

use super::session::BrokerApiFactory;
use super::BrokerApi;
use crate::error::{GatewayError, GatewayResult};
use crate::models::Candle;
use crate::store::TradingAccount;

#[derive(Clone)]
pub struct BrokerRestClient {
    client: Client,
    base_url: String,
}

impl BrokerRestClient {
    pub fn new(base_url: String, api_key: &str, access_token: &str) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("token {api_key}:{access_token}")
                        .parse()
                        .map_err(|_| {
                            GatewayError::Config("api credentials contain invalid header bytes".into())
                        })?,
                );
                headers
            })
            .build()
            .map_err(|e| GatewayError::Config(format!("build broker http client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn handle(&self, resp: reqwest::Response) -> GatewayResult<serde_json::Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_upstream_status(status.as_u16(), body));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| GatewayError::UpstreamPermanent(format!("malformed broker response: {e}")))
    }
}

/// Vendor candle rows arrive as positional arrays:
/// `[timestamp, open, high, low, close, volume, oi?]`.
fn parse_candle_row(row: &serde_json::Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let date = DateTime::parse_from_rfc3339(fields.first()?.as_str()?)
        .ok()?
        .with_timezone(&Utc);
    Some(Candle {
        date,
        o: fields.get(1)?.as_f64()?,
        h: fields.get(2)?.as_f64()?,
        l: fields.get(3)?.as_f64()?,
        c: fields.get(4)?.as_f64()?,
        v: fields.get(5)?.as_u64()?,
        oi: fields.get(6).and_then(|v| v.as_u64()),
        greeks: None,
    })
}

#[async_trait]
impl BrokerApi for BrokerRestClient {
    async fn place_order(&self, params: &serde_json::Value) -> GatewayResult<serde_json::Value> {
        let resp = self
            .client
            .post(self.url("/orders/regular"))
            .json(params)
            .send()
            .await?;
        self.handle(resp).await
    }

    async fn modify_order(
        &self,
        order_id: &str,
        params: &serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        let resp = self
            .client
            .put(self.url(&format!("/orders/regular/{order_id}")))
            .json(params)
            .send()
            .await?;
        self.handle(resp).await
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<serde_json::Value> {
        let resp = self
            .client
            .delete(self.url(&format!("/orders/regular/{order_id}")))
            .send()
            .await?;
        self.handle(resp).await
    }

    async fn get_quote(&self, tokens: &[u32]) -> GatewayResult<serde_json::Value> {
        let qp: Vec<(&str, String)> = tokens.iter().map(|t| ("i", t.to_string())).collect();
        let resp = self
            .client
            .get(self.url("/quote"))
            .query(&qp)
            .send()
            .await?;
        self.handle(resp).await
    }

    async fn historical_candles(
        &self,
        token: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
        with_oi: bool,
    ) -> GatewayResult<Vec<Candle>> {
        let resp = self
            .client
            .get(self.url(&format!("/instruments/historical/{token}/{interval}")))
            .query(&[
                ("from", from.format("%Y-%m-%d %H:%M:%S").to_string()),
                ("to", to.format("%Y-%m-%d %H:%M:%S").to_string()),
                ("oi", if with_oi { "1" } else { "0" }.to_string()),
            ])
            .send()
            .await?;
        let body = self.handle(resp).await?;

        let rows = body
            .pointer("/data/candles")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(parse_candle_row).collect())
    }
}

/// Default factory: one REST client per account, authenticated with the
/// account's decrypted credentials.
pub struct RestBrokerFactory {
    base_url: String,
}

impl RestBrokerFactory {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("BROKER_API_BASE")
                .unwrap_or_else(|_| "https://api.broker.invalid/v1".to_string()),
        }
    }
}

impl BrokerApiFactory for RestBrokerFactory {
    fn create(&self, account: &TradingAccount) -> Arc<dyn BrokerApi> {
        let access_token = account.access_token.as_deref().unwrap_or_default();
        match BrokerRestClient::new(self.base_url.clone(), &account.api_key, access_token) {
            Ok(client) => Arc::new(client),
            Err(e) => Arc::new(BrokenBroker {
                reason: e.to_string(),
            }),
        }
    }
}

/// Placeholder client for accounts whose credentials could not build a
/// real one; every call surfaces the original configuration error.
struct BrokenBroker {
    reason: String,
}

#[async_trait]
impl BrokerApi for BrokenBroker {
    async fn place_order(&self, _: &serde_json::Value) -> GatewayResult<serde_json::Value> {
        Err(GatewayError::Config(self.reason.clone()))
    }
    async fn modify_order(
        &self,
        _: &str,
        _: &serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        Err(GatewayError::Config(self.reason.clone()))
    }
    async fn cancel_order(&self, _: &str) -> GatewayResult<serde_json::Value> {
        Err(GatewayError::Config(self.reason.clone()))
    }
    async fn get_quote(&self, _: &[u32]) -> GatewayResult<serde_json::Value> {
        Err(GatewayError::Config(self.reason.clone()))
    }
    async fn historical_candles(
        &self,
        _: u32,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
        _: &str,
        _: bool,
    ) -> GatewayResult<Vec<Candle>> {
        Err(GatewayError::Config(self.reason.clone()))
    }
}
