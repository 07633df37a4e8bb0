//! API key issuance for authenticated clients.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::AuthConfig;

/// Issued API key with its expiry.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub api_key: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory store of issued API keys.
#[derive(Debug)]
pub struct ApiKeyStore {
    users: HashMap<String, String>,
    ttl: Duration,
    keys: DashMap<String, DateTime<Utc>>,
}

impl ApiKeyStore {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            users: config.users.clone(),
            ttl: config.api_key_ttl,
            keys: DashMap::new(),
        }
    }

    /// Issue a new key when the credentials match a configured user.
    pub fn login(&self, username: &str, password: &str) -> Option<IssuedKey> {
        match self.users.get(username) {
            Some(expected) if expected == password => {}
            _ => {
                info!(username = %username, "Rejected login");
                return None;
            }
        }

        self.purge_expired(Utc::now());

        let api_key = generate_api_key();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.keys.insert(api_key.clone(), expires_at);

        info!(username = %username, %expires_at, "Issued API key");
        Some(IssuedKey {
            api_key,
            expires_at,
        })
    }

    /// Whether `key` was issued and has not expired at `now`.
    pub fn is_valid(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.keys.get(key).is_some_and(|expires_at| now <= *expires_at)
    }

    /// Forget expired keys. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, expires_at| now <= *expires_at);
        let removed = before.saturating_sub(self.keys.len());
        if removed > 0 {
            debug!(removed, "Purged expired API keys");
        }
        removed
    }
}

/// 32 random bytes, URL-safe base64 without padding.
fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl: Duration) -> ApiKeyStore {
        ApiKeyStore::new(&AuthConfig {
            users: HashMap::from([("ops".to_string(), "secret".to_string())]),
            api_key_ttl: ttl,
        })
    }

    #[test]
    fn test_login_issues_valid_key() {
        let store = store(Duration::from_secs(60));
        let issued = store.login("ops", "secret").unwrap();
        assert_eq!(issued.api_key.len(), 43);
        assert!(store.is_valid(&issued.api_key, Utc::now()));
        assert!(!store.is_valid("forged", Utc::now()));
    }

    #[test]
    fn test_wrong_credentials_rejected() {
        let store = store(Duration::from_secs(60));
        assert!(store.login("ops", "wrong").is_none());
        assert!(store.login("nobody", "secret").is_none());
    }

    #[test]
    fn test_keys_expire() {
        let store = store(Duration::from_secs(60));
        let issued = store.login("ops", "secret").unwrap();
        let later = issued.expires_at + chrono::Duration::seconds(1);
        assert!(!store.is_valid(&issued.api_key, later));
        assert_eq!(store.purge_expired(later), 1);
    }
}
