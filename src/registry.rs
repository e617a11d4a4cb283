//! Read-only instrument registry.
//!
//! Loaded from the store at boot, refreshed by the daily loop or the
//! admin endpoint. The hot path only ever takes the read lock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use crate::models::{Instrument, Segment};
use crate::store::SubscriptionStore;

pub struct InstrumentRegistry {
    by_token: RwLock<HashMap<u32, Arc<Instrument>>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self {
            by_token: RwLock::new(HashMap::new()),
        }
    }

    pub fn load_from_store(&self, store: &SubscriptionStore) -> Result<usize> {
        let instruments = store.load_instruments()?;
        let count = instruments.len();
        self.replace(instruments);
        info!(instruments = count, "instrument registry loaded");
        Ok(count)
    }

    pub fn replace(&self, instruments: Vec<Instrument>) {
        let map: HashMap<u32, Arc<Instrument>> = instruments
            .into_iter()
            .map(|inst| (inst.token, Arc::new(inst)))
            .collect();
        *self.by_token.write() = map;
    }

    pub fn get(&self, token: u32) -> Option<Arc<Instrument>> {
        self.by_token.read().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_token.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.read().is_empty()
    }

    /// Symbols of all index instruments, used to seed the underlying
    /// spot cache.
    pub fn index_symbols(&self) -> Vec<(u32, String)> {
        self.by_token
            .read()
            .values()
            .filter(|inst| inst.segment == Segment::Idx)
            .map(|inst| (inst.token, inst.symbol.clone()))
            .collect()
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionType;

    #[test]
    fn test_replace_and_lookup() {
        let registry = InstrumentRegistry::new();
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
                token: 1,
                symbol: "NIFTY25AUG24000CE".into(),
                segment: Segment::Opt,
                option_type: Some(OptionType::Ce),
                strike: Some(24_000.0),
                expiry: None,
                lot_size: 50,
                tick_size: 0.05,
                underlying_token: Some(256_265),
            },
        ]);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(1).unwrap().is_option());
        assert!(registry.get(999).is_none());
        assert_eq!(registry.index_symbols(), vec![(256_265, "NIFTY 50".to_string())]);
    }
}
