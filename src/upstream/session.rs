//! Session orchestrator: broker accounts, their decrypted sessions and
//! per-account circuit breakers.
//!
//! Accounts load from the encrypted store at boot. An account is
//! "available" for streaming or order dispatch when it holds an access
//! token and its breaker is not open; auth failures flip the token
//! invalid until an administrator re-provisions it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::BrokerApi;
use crate::error::{GatewayError, GatewayResult};
use crate::reliability::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::store::TradingAccount;

/// Builds the broker REST client for one account.
pub trait BrokerApiFactory: Send + Sync {
    fn create(&self, account: &TradingAccount) -> Arc<dyn BrokerApi>;
}

struct AccountEntry {
    account: TradingAccount,
    broker: Arc<dyn BrokerApi>,
    breaker: Arc<CircuitBreaker>,
    auth_valid: bool,
}

pub struct SessionOrchestrator {
    entries: RwLock<Vec<AccountEntry>>,
    factory: Arc<dyn BrokerApiFactory>,
    breaker_config: BreakerConfig,
}

impl SessionOrchestrator {
    pub fn new(
        accounts: Vec<TradingAccount>,
        factory: Arc<dyn BrokerApiFactory>,
        breaker_config: BreakerConfig,
    ) -> Self {
        let mut entries: Vec<AccountEntry> = accounts
            .into_iter()
            .map(|account| {
                let broker = factory.create(&account);
                let breaker = Arc::new(CircuitBreaker::new(
                    format!("account:{}", account.account_id),
                    breaker_config.clone(),
                ));
                let auth_valid = account.access_token.is_some();
                if !auth_valid {
                    warn!(account = %account.account_id, "account has no access token");
                }
                AccountEntry {
                    account,
                    broker,
                    breaker,
                    auth_valid,
                }
            })
            .collect();
        // Stable account order is the tie-break for reconciler placement.
        entries.sort_by(|a, b| a.account.account_id.cmp(&b.account.account_id));
        info!(accounts = entries.len(), "session orchestrator ready");
        Self {
            entries: RwLock::new(entries),
            factory,
            breaker_config,
        }
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.account.account_id.clone())
            .collect()
    }

    /// Accounts eligible for new work: authenticated and breaker not open.
    pub fn available_accounts(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.auth_valid && e.breaker.state() != CircuitState::Open)
            .map(|e| e.account.account_id.clone())
            .collect()
    }

    pub fn is_available(&self, account_id: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.account.account_id == account_id
                && e.auth_valid
                && e.breaker.state() != CircuitState::Open)
    }

    pub fn breaker(&self, account_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.account.account_id == account_id)
            .map(|e| e.breaker.clone())
    }

    /// Broker client for dispatch. Surfaces an auth error when the
    /// account is unknown or its session is invalid.
    pub fn broker(&self, account_id: &str) -> GatewayResult<Arc<dyn BrokerApi>> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.account.account_id == account_id)
            .ok_or_else(|| GatewayError::Auth(format!("unknown account {account_id}")))?;
        if !entry.auth_valid {
            return Err(GatewayError::Auth(format!(
                "account {account_id} session invalid"
            )));
        }
        Ok(entry.broker.clone())
    }

    /// Streaming credentials for the market feed URL.
    pub fn stream_credentials(&self, account_id: &str) -> GatewayResult<(String, String)> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.account.account_id == account_id)
            .ok_or_else(|| GatewayError::Auth(format!("unknown account {account_id}")))?;
        let token = entry
            .account
            .access_token
            .clone()
            .filter(|_| entry.auth_valid)
            .ok_or_else(|| GatewayError::Auth(format!("account {account_id} session invalid")))?;
        Ok((entry.account.api_key.clone(), token))
    }

    /// Permanent auth failure reported by a caller; the account drops out
    /// of the available set until re-provisioned.
    pub fn mark_auth_failed(&self, account_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.account.account_id == account_id)
        {
            warn!(account = %account_id, "marking account session invalid");
            entry.auth_valid = false;
        }
    }

    /// Re-provision an account (admin path / fresh login).
    pub fn upsert_account(&self, account: TradingAccount) {
        let broker = self.factory.create(&account);
        let mut entries = self.entries.write();
        match entries
            .iter_mut()
            .find(|e| e.account.account_id == account.account_id)
        {
            Some(entry) => {
                entry.auth_valid = account.access_token.is_some();
                entry.broker = broker;
                entry.account = account;
                entry.breaker.reset();
            }
            None => {
                let breaker = Arc::new(CircuitBreaker::new(
                    format!("account:{}", account.account_id),
                    self.breaker_config.clone(),
                ));
                let auth_valid = account.access_token.is_some();
                entries.push(AccountEntry {
                    account,
                    broker,
                    breaker,
                    auth_valid,
                });
                entries.sort_by(|a, b| a.account.account_id.cmp(&b.account.account_id));
            }
        }
    }

    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.account.account_id.clone(), e.breaker.state()))
            .collect()
    }
}
