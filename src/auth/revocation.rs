//! Revocation registry for identity tokens.
//!
//! Keyed by token hash. Revoking cuts new subscribes immediately and
//! causes the client hub to close the affected sockets.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::info;

pub struct RevocationRegistry {
    revoked: RwLock<HashSet<String>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self {
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn revoke(&self, token_hash: &str) {
        info!(token_hash, "identity token revoked");
        self.revoked.write().insert(token_hash.to_string());
    }

    pub fn is_revoked(&self, token_hash: &str) -> bool {
        self.revoked.read().contains(token_hash)
    }

    pub fn len(&self) -> usize {
        self.revoked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.read().is_empty()
    }
}

impl Default for RevocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
