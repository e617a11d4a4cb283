use serde::{Deserialize, Serialize};

/// Roles carried in verified identity tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserRole {
    #[serde(rename = "admin")]
    Admin, // Full access including admin endpoints
    #[serde(rename = "trader")]
    Trader, // Streaming + order operations
    #[serde(rename = "viewer")]
    Viewer, // Read-only access
}

impl UserRole {
    pub fn as_str(&self) -> &str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Trader => "trader",
            UserRole::Viewer => "viewer",
        }
    }
}

/// JWT claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user id)
    pub username: String,
    pub role: UserRole,
    pub exp: usize, // expiration timestamp
}
