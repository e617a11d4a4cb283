use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Exchange segment of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Segment {
    Opt,
    Fut,
    Eq,
    Idx,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Opt => "OPT",
            Segment::Fut => "FUT",
            Segment::Eq => "EQ",
            Segment::Idx => "IDX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPT" => Some(Segment::Opt),
            "FUT" => Some(Segment::Fut),
            "EQ" => Some(Segment::Eq),
            "IDX" => Some(Segment::Idx),
            _ => None,
        }
    }
}

/// Call / put side of an option contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Ce,
    Pe,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Ce => "CE",
            OptionType::Pe => "PE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CE" => Some(OptionType::Ce),
            "PE" => Some(OptionType::Pe),
            _ => None,
        }
    }
}

/// Immutable instrument metadata keyed by exchange token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: u32,
    pub symbol: String,
    pub segment: Segment,
    pub option_type: Option<OptionType>,
    pub strike: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub lot_size: u32,
    pub tick_size: f64,
    pub underlying_token: Option<u32>,
}

impl Instrument {
    pub fn is_option(&self) -> bool {
        self.segment == Segment::Opt
    }

    /// Instrument class used in pub/sub topic names, derived from the
    /// symbol prefix (e.g. "NIFTY25AUG24000CE" -> "nifty").
    pub fn class(&self) -> String {
        class_of_symbol(&self.symbol)
    }
}

/// Underlying family a symbol belongs to, used in pub/sub topic names.
pub fn class_of_symbol(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    if upper.starts_with("BANKNIFTY") {
        "banknifty".to_string()
    } else if upper.starts_with("FINNIFTY") {
        "finnifty".to_string()
    } else if upper.starts_with("NIFTY") {
        "nifty".to_string()
    } else {
        symbol
            .split_whitespace()
            .next()
            .unwrap_or(symbol)
            .to_lowercase()
    }
}

/// Desired streaming mode for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscribeMode {
    Full,
    Quote,
    Ltp,
}

impl SubscribeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscribeMode::Full => "FULL",
            SubscribeMode::Quote => "QUOTE",
            SubscribeMode::Ltp => "LTP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL" => Some(SubscribeMode::Full),
            "QUOTE" => Some(SubscribeMode::Quote),
            "LTP" => Some(SubscribeMode::Ltp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }
}

/// Persistent record of a desired instrument subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub token: u32,
    pub symbol: String,
    pub segment: Segment,
    pub status: SubscriptionStatus,
    pub requested_mode: SubscribeMode,
    pub account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One level of market depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: u32,
    pub orders: u32,
}

/// Raw tick as decoded from the upstream vendor frame, before validation.
///
/// Only `token`, `last` and `ts_ms` are required; everything else depends
/// on the subscribed mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTick {
    pub token: u32,
    pub last: f64,
    pub ts_ms: u64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid_qty: Option<u32>,
    #[serde(default)]
    pub ask_qty: Option<u32>,
    #[serde(default)]
    pub depth: Option<Vec<DepthLevel>>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub last_qty: Option<u32>,
    #[serde(default)]
    pub oi: Option<u64>,
    /// Vendor-supplied implied volatility, if the feed carries one.
    #[serde(default)]
    pub iv: Option<f64>,
}

/// Enriched option tick published on the bus and fanned out to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub token: u32,
    pub symbol: String,
    pub last: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_qty: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_qty: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<Vec<DepthLevel>>,
    pub volume: u64,
    pub oi: u64,
    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub ts_ms: u64,
    pub is_mock: bool,
    /// Set when the underlying spot was unavailable and the analytics
    /// fields were zeroed instead of computed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub analytics_stale: bool,
}

/// Historical candle returned by the /history endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeks: Option<CandleGreeks>,
}

/// Greeks attached to a historical candle when enrichment is requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleGreeks {
    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Completed OHLCV bar for an underlying index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingBar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub ts_sec: u64,
    pub is_mock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_round_trip() {
        for seg in [Segment::Opt, Segment::Fut, Segment::Eq, Segment::Idx] {
            assert_eq!(Segment::parse(seg.as_str()), Some(seg));
        }
        assert_eq!(Segment::parse("BOGUS"), None);
    }

    #[test]
    fn test_instrument_class_from_symbol() {
        let mk = |symbol: &str| Instrument {
            token: 1,
            symbol: symbol.to_string(),
            segment: Segment::Opt,
            option_type: Some(OptionType::Ce),
            strike: Some(24000.0),
            expiry: None,
            lot_size: 50,
            tick_size: 0.05,
            underlying_token: Some(256265),
        };

        assert_eq!(mk("NIFTY25AUG24000CE").class(), "nifty");
        assert_eq!(mk("BANKNIFTY25AUG51000PE").class(), "banknifty");
        assert_eq!(mk("FINNIFTY25AUG23000CE").class(), "finnifty");
        assert_eq!(mk("RELIANCE").class(), "reliance");
    }

    #[test]
    fn test_option_snapshot_serializes_compact() {
        let snap = OptionSnapshot {
            token: 12345,
            symbol: "NIFTY25AUG24000CE".to_string(),
            last: 182.5,
            bid: None,
            ask: None,
            bid_qty: None,
            ask_qty: None,
            depth: None,
            volume: 1_000,
            oi: 5_000,
            iv: 0.14,
            delta: 0.52,
            gamma: 0.0004,
            theta: -5.1,
            vega: 12.2,
            ts_ms: 1_700_000_000_000,
            is_mock: false,
            analytics_stale: false,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("\"bid\""));
        assert!(!json.contains("analytics_stale"));
        assert!(json.contains("\"delta\":0.52"));
    }

    #[test]
    fn test_raw_tick_minimal_fields() {
        let tick: RawTick =
            serde_json::from_str(r#"{"token":256265,"last":24120.5,"ts_ms":1700000000000}"#)
                .unwrap();
        assert_eq!(tick.token, 256265);
        assert!(tick.bid.is_none());
        assert!(tick.depth.is_none());
    }
}
