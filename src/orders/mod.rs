//! Idempotent broker order execution.
//!
//! Tasks are persisted rows keyed by a deterministic idempotency hash;
//! the engine in [`engine`] drains them with retry, backoff and
//! per-account circuit breaking.

pub mod engine;

pub use engine::{OrderEngine, OrderEngineHandle};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOperation {
    Place,
    Modify,
    Cancel,
}

impl OrderOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderOperation::Place => "place",
            OrderOperation::Modify => "modify",
            OrderOperation::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "place" => Some(OrderOperation::Place),
            "modify" => Some(OrderOperation::Modify),
            "cancel" => Some(OrderOperation::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    DeadLetter,
}

impl OrderTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderTaskStatus::Pending => "pending",
            OrderTaskStatus::Running => "running",
            OrderTaskStatus::Retrying => "retrying",
            OrderTaskStatus::Completed => "completed",
            OrderTaskStatus::Failed => "failed",
            OrderTaskStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderTaskStatus::Pending),
            "running" => Some(OrderTaskStatus::Running),
            "retrying" => Some(OrderTaskStatus::Retrying),
            "completed" => Some(OrderTaskStatus::Completed),
            "failed" => Some(OrderTaskStatus::Failed),
            "dead_letter" => Some(OrderTaskStatus::DeadLetter),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderTaskStatus::Completed | OrderTaskStatus::Failed | OrderTaskStatus::DeadLetter
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTask {
    pub task_id: Uuid,
    pub idempotency_key: String,
    pub operation: OrderOperation,
    pub params: serde_json::Value,
    pub account_id: String,
    pub status: OrderTaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field names that participate in the idempotency hash, in their
/// canonical spelling. Aliases seen from different broker client
/// libraries are folded in.
const CANONICAL_FIELDS: &[(&str, &[&str])] = &[
    ("tradingsymbol", &["tradingsymbol", "trading_symbol", "symbol"]),
    ("quantity", &["quantity", "qty"]),
    ("transaction_type", &["transaction_type", "side"]),
    ("exchange", &["exchange"]),
    ("product", &["product"]),
    ("order_type", &["order_type", "ordertype"]),
    ("price", &["price"]),
];

/// Project `params` onto the stable field set with sorted keys. Unknown
/// fields do not participate in identity.
pub fn canonicalize_params(params: &serde_json::Value) -> serde_json::Value {
    let mut canonical = BTreeMap::new();
    if let Some(obj) = params.as_object() {
        for (canonical_name, aliases) in CANONICAL_FIELDS {
            for alias in *aliases {
                if let Some(value) = obj.get(*alias) {
                    // Numbers hash as their JSON text; normalize integral
                    // floats so 50 and 50.0 collide.
                    let value = match value.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < 9e15 => {
                            serde_json::json!(f as i64)
                        }
                        _ => value.clone(),
                    };
                    canonical.insert(canonical_name.to_string(), value);
                    break;
                }
            }
        }
    }
    serde_json::to_value(canonical).unwrap_or(serde_json::Value::Null)
}

/// Deterministic task identity over operation, account and canonical
/// params.
pub fn idempotency_key(
    operation: OrderOperation,
    account_id: &str,
    params: &serde_json::Value,
) -> String {
    let canonical = canonicalize_params(params);
    let mut hasher = Sha256::new();
    hasher.update(operation.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalization_is_order_insensitive() {
        let a = json!({
            "tradingsymbol": "NIFTY25NOVFUT", "quantity": 50,
            "transaction_type": "BUY", "exchange": "NFO",
            "product": "NRML", "order_type": "MARKET"
        });
        let b = json!({
            "order_type": "MARKET", "product": "NRML", "exchange": "NFO",
            "transaction_type": "BUY", "quantity": 50,
            "tradingsymbol": "NIFTY25NOVFUT"
        });
        assert_eq!(
            idempotency_key(OrderOperation::Place, "A1", &a),
            idempotency_key(OrderOperation::Place, "A1", &b)
        );
    }

    #[test]
    fn test_aliases_fold_to_canonical_names() {
        let a = json!({"tradingsymbol": "X", "quantity": 10});
        let b = json!({"trading_symbol": "X", "qty": 10});
        assert_eq!(
            idempotency_key(OrderOperation::Place, "A1", &a),
            idempotency_key(OrderOperation::Place, "A1", &b)
        );
    }

    #[test]
    fn test_unknown_fields_ignored_for_identity() {
        let a = json!({"tradingsymbol": "X", "quantity": 10, "tag": "alpha"});
        let b = json!({"tradingsymbol": "X", "quantity": 10, "tag": "beta"});
        assert_eq!(
            idempotency_key(OrderOperation::Place, "A1", &a),
            idempotency_key(OrderOperation::Place, "A1", &b)
        );
    }

    #[test]
    fn test_identity_varies_by_operation_account_and_params() {
        let params = json!({"tradingsymbol": "X", "quantity": 10});
        let base = idempotency_key(OrderOperation::Place, "A1", &params);
        assert_ne!(base, idempotency_key(OrderOperation::Cancel, "A1", &params));
        assert_ne!(base, idempotency_key(OrderOperation::Place, "A2", &params));
        assert_ne!(
            base,
            idempotency_key(OrderOperation::Place, "A1", &json!({"tradingsymbol": "X", "quantity": 20}))
        );
    }

    #[test]
    fn test_integral_float_quantity_collides_with_integer() {
        let a = json!({"tradingsymbol": "X", "quantity": 50});
        let b = json!({"tradingsymbol": "X", "quantity": 50.0});
        assert_eq!(
            idempotency_key(OrderOperation::Place, "A1", &a),
            idempotency_key(OrderOperation::Place, "A1", &b)
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(OrderTaskStatus::Completed.is_terminal());
        assert!(OrderTaskStatus::Failed.is_terminal());
        assert!(OrderTaskStatus::DeadLetter.is_terminal());
        assert!(!OrderTaskStatus::Pending.is_terminal());
        assert!(!OrderTaskStatus::Running.is_terminal());
        assert!(!OrderTaskStatus::Retrying.is_terminal());
    }
}
