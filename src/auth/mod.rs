//! Identity token verification and session binding.
//!
//! Token issuance is external; this module only verifies bearer identity
//! tokens, extracts claims for RBAC, and tracks revocations so live
//! WebSocket sessions can be cut when a token is withdrawn.

pub mod jwt;
pub mod middleware;
pub mod models;
pub mod revocation;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, require_admin};
pub use models::{Claims, UserRole};
pub use revocation::RevocationRegistry;

use sha2::{Digest, Sha256};

/// Stable fingerprint of a presented identity token; stored instead of
/// the token itself.
pub fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hash_is_stable_and_opaque() {
        let h1 = token_hash("secret-token");
        let h2 = token_hash("secret-token");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(!h1.contains("secret"));
        assert_ne!(h1, token_hash("other-token"));
    }
}
