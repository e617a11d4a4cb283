//! Route handlers.
//!
//! Public: health and metrics. Authenticated: subscriptions, orders,
//! history and the tick WebSocket. Admin role: instrument refresh and
//! dead-letter management.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::ApiState;
use crate::auth::middleware::{AuthLayerState, VerifiedTokenHash};
use crate::auth::{auth_middleware, require_admin, Claims};
use crate::error::{GatewayError, GatewayResult};
use crate::greeks;
use crate::models::{Candle, CandleGreeks, SubscribeMode, SubscriptionStatus};
use crate::orders::{OrderOperation, OrderTaskStatus};
use crate::pipeline::ticks::time_to_expiry;
use crate::reliability::CircuitState;

pub fn build_router(state: ApiState) -> Router {
    let auth_state = AuthLayerState {
        jwt: state.jwt.clone(),
        revocations: state.revocations.clone(),
    };

    let public = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state.clone());

    // Layer order is inside-out: auth (added last) runs first, then the
    // role gate.
    let admin = Router::new()
        .route("/admin/instrument-refresh", post(admin_instrument_refresh))
        .route("/admin/orders/dead-letter", get(admin_dead_letter))
        .route(
            "/admin/orders/dead-letter/:task_id/replay",
            post(admin_dead_letter_replay),
        )
        .route_layer(axum_mw::from_fn(require_admin))
        .route_layer(axum_mw::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/:token", delete(delete_subscription))
        .route("/orders/regular", post(place_order))
        .route("/orders/regular/:order_id", put(modify_order))
        .route("/orders/regular/:order_id", delete(cancel_order))
        .route("/orders/tasks/:task_id", get(get_order_task))
        .route("/history", get(history))
        .route("/ws/ticks", get(ws_ticks))
        .route_layer(axum_mw::from_fn_with_state(auth_state, auth_middleware))
        .with_state(state);

    public.merge(protected).merge(admin)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    deps: serde_json::Value,
    active_subscriptions: usize,
}

/// Three-level health: ok, degraded (store unreachable, bus breaker
/// open, or some account breaker open), critical (store down or every
/// account breaker open).
async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let store_ok = state.subscriptions.active_count().is_ok();
    let active_subscriptions = state.subscriptions.active_count().unwrap_or(0);
    let bus_state = state.publisher.breaker_state();
    let breakers = state.sessions.breaker_states();

    let accounts_total = breakers.len();
    let accounts_open = breakers
        .values()
        .filter(|s| **s == CircuitState::Open)
        .count();

    let status = if !store_ok || (accounts_total > 0 && accounts_open == accounts_total) {
        "critical"
    } else if bus_state == CircuitState::Open || accounts_open > 0 {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        deps: json!({
            "store": if store_ok { "ok" } else { "down" },
            "bus_breaker": bus_state.to_string(),
            "accounts": breakers
                .iter()
                .map(|(id, s)| (id.clone(), s.to_string()))
                .collect::<std::collections::HashMap<_, _>>(),
        }),
        active_subscriptions,
    })
}

async fn metrics_text(State(state): State<ApiState>) -> Response {
    state.prometheus.render().into_response()
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionRequest {
    token: u32,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, rename = "accountId")]
    account_id: Option<String>,
}

async fn create_subscription(
    State(state): State<ApiState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> GatewayResult<(StatusCode, Json<serde_json::Value>)> {
    let instrument = state
        .registry
        .get(req.token)
        .ok_or_else(|| GatewayError::Validation(format!("unknown token {}", req.token)))?;
    let mode = match req.mode.as_deref() {
        None => SubscribeMode::Quote,
        Some(m) => SubscribeMode::parse(m)
            .ok_or_else(|| GatewayError::Validation(format!("invalid mode {m}")))?,
    };

    state
        .subscriptions
        .upsert_subscription(
            instrument.token,
            &instrument.symbol,
            instrument.segment,
            mode,
            req.account_id.as_deref(),
        )
        .map_err(|e| GatewayError::Store(e.to_string()))?;
    state.reconciler.trigger();

    Ok((StatusCode::CREATED, Json(json!({"token": req.token}))))
}

#[derive(Debug, Deserialize)]
struct ListSubscriptionsQuery {
    status: Option<String>,
}

async fn list_subscriptions(
    State(state): State<ApiState>,
    Query(query): Query<ListSubscriptionsQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            SubscriptionStatus::parse(s)
                .ok_or_else(|| GatewayError::Validation(format!("invalid status {s}")))?,
        ),
    };
    let subscriptions = state
        .subscriptions
        .list(status)
        .map_err(|e| GatewayError::Store(e.to_string()))?;
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

async fn delete_subscription(
    State(state): State<ApiState>,
    Path(token): Path<u32>,
) -> GatewayResult<StatusCode> {
    let existed = state
        .subscriptions
        .deactivate(token)
        .map_err(|e| GatewayError::Store(e.to_string()))?;
    if !existed {
        return Err(GatewayError::Validation(format!(
            "no subscription for token {token}"
        )));
    }
    state.reconciler.trigger();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct OrderRequest {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(flatten)]
    params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OrderResponse {
    task_id: Uuid,
    status: OrderTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<String>,
}

fn order_response(task: crate::orders::OrderTask) -> Json<OrderResponse> {
    let order_id = task
        .result
        .as_ref()
        .and_then(|r| r.get("order_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Json(OrderResponse {
        task_id: task.task_id,
        status: task.status,
        order_id,
    })
}

async fn place_order(
    State(state): State<ApiState>,
    Json(req): Json<OrderRequest>,
) -> GatewayResult<(StatusCode, Json<OrderResponse>)> {
    let task = state.orders.0.submit(
        OrderOperation::Place,
        serde_json::Value::Object(req.params),
        &req.account_id,
    )?;
    Ok((StatusCode::ACCEPTED, order_response(task)))
}

async fn modify_order(
    State(state): State<ApiState>,
    Path(order_id): Path<String>,
    Json(req): Json<OrderRequest>,
) -> GatewayResult<Json<OrderResponse>> {
    let mut params = req.params;
    params.insert("order_id".to_string(), json!(order_id));
    let task = state.orders.0.submit(
        OrderOperation::Modify,
        serde_json::Value::Object(params),
        &req.account_id,
    )?;
    Ok(order_response(task))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    #[serde(rename = "accountId")]
    account_id: String,
}

async fn cancel_order(
    State(state): State<ApiState>,
    Path(order_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> GatewayResult<Json<OrderResponse>> {
    let task = state.orders.0.submit(
        OrderOperation::Cancel,
        json!({"order_id": order_id}),
        &query.account_id,
    )?;
    Ok(order_response(task))
}

async fn get_order_task(
    State(state): State<ApiState>,
    Path(task_id): Path<Uuid>,
) -> GatewayResult<Json<crate::orders::OrderTask>> {
    let task = state
        .orders
        .0
        .get(task_id)?
        .ok_or_else(|| GatewayError::Validation(format!("unknown task {task_id}")))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    token: u32,
    from: String,
    to: String,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default)]
    oi: bool,
}

fn default_interval() -> String {
    "day".to_string()
}

fn parse_history_ts(s: &str) -> GatewayResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight"))
        })
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .map_err(|_| GatewayError::Validation(format!("unparseable timestamp {s}")))
}

/// Historical candles via the first available account, with Greeks
/// enrichment for option instruments against the current spot.
async fn history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let from = parse_history_ts(&query.from)?;
    let to = parse_history_ts(&query.to)?;
    if from >= to {
        return Err(GatewayError::Validation("from must precede to".into()));
    }

    let account = state
        .sessions
        .available_accounts()
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::UpstreamTransient("no available accounts".into()))?;
    let broker = state.sessions.broker(&account)?;
    let mut candles = broker
        .historical_candles(query.token, from, to, &query.interval, query.oi)
        .await?;

    if let Some(instrument) = state.registry.get(query.token) {
        if instrument.is_option() {
            enrich_candles(&state, &instrument, &mut candles);
        }
    }

    Ok(Json(json!({ "candles": candles })))
}

fn enrich_candles(
    state: &ApiState,
    instrument: &crate::models::Instrument,
    candles: &mut [Candle],
) {
    let (Some(option_type), Some(strike), Some(expiry)) = (
        instrument.option_type,
        instrument.strike,
        instrument.expiry,
    ) else {
        return;
    };
    let Some(spot) = instrument
        .underlying_token
        .and_then(|t| state.pipeline.spot(t))
    else {
        return;
    };
    let rate = state.settings.pipeline.interest_rate;
    let div_yield = state.settings.pipeline.dividend_yield;

    for candle in candles.iter_mut() {
        let t = time_to_expiry(expiry, candle.date);
        let Some(iv) = greeks::implied_vol(candle.c, spot, strike, t, rate, div_yield, option_type)
        else {
            continue;
        };
        candle.greeks = Some(CandleGreeks {
            iv,
            delta: greeks::delta(spot, strike, t, iv, rate, div_yield, option_type),
            gamma: greeks::gamma(spot, strike, t, iv, rate, div_yield),
            theta: greeks::theta(spot, strike, t, iv, rate, div_yield, option_type),
            vega: greeks::vega(spot, strike, t, iv, rate, div_yield),
        });
    }
}

/// Admin: reload the instrument registry from the store and reconcile.
async fn admin_instrument_refresh(State(state): State<ApiState>) -> GatewayResult<StatusCode> {
    state
        .registry
        .load_from_store(&state.subscriptions)
        .map_err(|e| GatewayError::Store(e.to_string()))?;
    state.hub.index_underlyings(state.registry.index_symbols());
    state.reconciler.trigger();
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_dead_letter(
    State(state): State<ApiState>,
) -> GatewayResult<Json<serde_json::Value>> {
    let tasks = state.orders.0.dead_letter(200)?;
    Ok(Json(json!({ "tasks": tasks })))
}

/// Replay resets `attempts` to zero and re-enqueues the task as pending.
async fn admin_dead_letter_replay(
    State(state): State<ApiState>,
    Path(task_id): Path<Uuid>,
) -> GatewayResult<Json<serde_json::Value>> {
    let replayed = state.orders.0.replay(task_id)?;
    if !replayed {
        return Err(GatewayError::Validation(format!(
            "task {task_id} is not in dead_letter"
        )));
    }
    Ok(Json(json!({"task_id": task_id, "status": "pending"})))
}

/// Authenticated tick stream; claims were established by the auth
/// middleware before the upgrade.
async fn ws_ticks(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(VerifiedTokenHash(token_hash)): Extension<VerifiedTokenHash>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        crate::hub::handle_socket(socket, hub, claims, token_hash).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_timestamp_formats() {
        assert!(parse_history_ts("2025-08-01T09:15:00Z").is_ok());
        assert!(parse_history_ts("2025-08-01 09:15:00").is_ok());
        assert!(parse_history_ts("2025-08-01").is_ok());
        assert!(parse_history_ts("yesterday").is_err());
    }

    #[test]
    fn test_order_request_flattens_params() {
        let req: OrderRequest = serde_json::from_value(json!({
            "accountId": "A1",
            "tradingsymbol": "NIFTY25NOVFUT",
            "quantity": 50
        }))
        .unwrap();
        assert_eq!(req.account_id, "A1");
        assert_eq!(req.params["quantity"], 50);
        assert!(!req.params.contains_key("accountId"));
    }
}
