//! Trading account persistence with envelope-encrypted credentials.
//!
//! Credentials never touch disk in the clear: each field is sealed with
//! AES-256-GCM under a master key supplied by the deployment's KMS
//! (`CREDENTIAL_MASTER_KEY`, 32 bytes hex). Ciphertexts are stored as
//! base64(nonce || ciphertext).

use anyhow::{anyhow, bail, Context, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trading_accounts (
    account_id TEXT PRIMARY KEY,
    api_key TEXT NOT NULL,
    api_secret TEXT NOT NULL,
    access_token TEXT,
    totp_seed TEXT,
    last_auth_at INTEGER
) WITHOUT ROWID;
"#;

/// Decrypted in-memory view of a broker account.
#[derive(Debug, Clone)]
pub struct TradingAccount {
    pub account_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: Option<String>,
    pub totp_seed: Option<String>,
    pub last_auth_at: Option<i64>,
}

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// `master_key_hex` must decode to exactly 32 bytes. Development
    /// deployments may omit it; a process-local key is derived instead,
    /// which makes stored credentials unreadable across restarts.
    pub fn new(master_key_hex: Option<&str>) -> Result<Self> {
        let key_bytes: [u8; 32] = match master_key_hex {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key.trim()).context("CREDENTIAL_MASTER_KEY hex")?;
                bytes
                    .try_into()
                    .map_err(|_| anyhow!("CREDENTIAL_MASTER_KEY must be 32 bytes"))?
            }
            None => {
                warn!("CREDENTIAL_MASTER_KEY not set; using ephemeral development key");
                let mut hasher = Sha256::new();
                hasher.update(uuid::Uuid::new_v4().as_bytes());
                hasher.finalize().into()
            }
        };
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encrypt credential: {e}"))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .context("credential base64")?;
        if blob.len() < 12 {
            bail!("credential blob too short");
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("decrypt credential: {e}"))?;
        String::from_utf8(plaintext).context("credential utf8")
    }
}

pub struct AccountStore {
    conn: Mutex<Connection>,
    cipher: CredentialCipher,
}

impl AccountStore {
    pub fn new(path: &str, cipher: CredentialCipher) -> Result<Self> {
        let conn = super::open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)
            .context("create account schema")?;
        info!(path, "account store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    pub fn upsert(&self, account: &TradingAccount) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trading_accounts
             (account_id, api_key, api_secret, access_token, totp_seed, last_auth_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id) DO UPDATE SET
                 api_key = excluded.api_key,
                 api_secret = excluded.api_secret,
                 access_token = excluded.access_token,
                 totp_seed = excluded.totp_seed,
                 last_auth_at = excluded.last_auth_at",
            params![
                account.account_id,
                self.cipher.seal(&account.api_key)?,
                self.cipher.seal(&account.api_secret)?,
                account
                    .access_token
                    .as_deref()
                    .map(|t| self.cipher.seal(t))
                    .transpose()?,
                account
                    .totp_seed
                    .as_deref()
                    .map(|t| self.cipher.seal(t))
                    .transpose()?,
                account.last_auth_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<TradingAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, api_key, api_secret, access_token, totp_seed, last_auth_at
             FROM trading_accounts ORDER BY account_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (account_id, api_key, api_secret, access_token, totp_seed, last_auth_at) = row?;
            out.push(TradingAccount {
                api_key: self.cipher.open(&api_key)?,
                api_secret: self.cipher.open(&api_secret)?,
                access_token: access_token.as_deref().map(|t| self.cipher.open(t)).transpose()?,
                totp_seed: totp_seed.as_deref().map(|t| self.cipher.open(t)).transpose()?,
                account_id,
                last_auth_at,
            });
        }
        Ok(out)
    }

    pub fn update_access_token(&self, account_id: &str, access_token: &str) -> Result<()> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trading_accounts SET access_token = ?2, last_auth_at = ?3 WHERE account_id = ?1",
            params![account_id, self.cipher.seal(access_token)?, now],
        )?;
        Ok(())
    }

    pub fn get(&self, account_id: &str) -> Result<Option<TradingAccount>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT account_id, api_key, api_secret, access_token, totp_seed, last_auth_at
                 FROM trading_accounts WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(account_id, api_key, api_secret, access_token, totp_seed, last_auth_at)| {
            Ok(TradingAccount {
                api_key: self.cipher.open(&api_key)?,
                api_secret: self.cipher.open(&api_secret)?,
                access_token: access_token.as_deref().map(|t| self.cipher.open(t)).transpose()?,
                totp_seed: totp_seed.as_deref().map(|t| self.cipher.open(t)).transpose()?,
                account_id,
                last_auth_at,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn store() -> AccountStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        std::mem::forget(dir);
        AccountStore::new(
            path.to_str().unwrap(),
            CredentialCipher::new(Some(TEST_KEY)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = CredentialCipher::new(Some(TEST_KEY)).unwrap();
        let sealed = cipher.seal("super-secret").unwrap();
        assert_ne!(sealed, "super-secret");
        assert_eq!(cipher.open(&sealed).unwrap(), "super-secret");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = CredentialCipher::new(Some(TEST_KEY)).unwrap();
        let sealed = cipher.seal("secret").unwrap();
        let mut blob = base64::engine::general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(blob);
        assert!(cipher.open(&tampered).is_err());
    }

    #[test]
    fn test_credentials_encrypted_at_rest() {
        let store = store();
        store
            .upsert(&TradingAccount {
                account_id: "A1".into(),
                api_key: "key-material".into(),
                api_secret: "secret-material".into(),
                access_token: Some("session-token".into()),
                totp_seed: None,
                last_auth_at: Some(1_700_000_000),
            })
            .unwrap();

        // Raw row must not contain plaintext.
        let raw: String = store.conn.lock().query_row(
            "SELECT api_secret FROM trading_accounts WHERE account_id = 'A1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
        assert!(!raw.contains("secret-material"));

        let loaded = store.get("A1").unwrap().unwrap();
        assert_eq!(loaded.api_secret, "secret-material");
        assert_eq!(loaded.access_token.as_deref(), Some("session-token"));
    }

    #[test]
    fn test_update_access_token() {
        let store = store();
        store
            .upsert(&TradingAccount {
                account_id: "A1".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                access_token: None,
                totp_seed: None,
                last_auth_at: None,
            })
            .unwrap();
        store.update_access_token("A1", "fresh-token").unwrap();
        let loaded = store.get("A1").unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("fresh-token"));
        assert!(loaded.last_auth_at.is_some());
    }
}
