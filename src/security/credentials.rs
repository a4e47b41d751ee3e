//! Encrypted credential store.
//!
//! Payloads are encrypted with the shared [`EncryptionManager`] on `store`
//! and only decrypted on `retrieve`. A decrypted value stays in a short-lived
//! cache (15 minutes by default); a cache hit is served even if the
//! credential's own TTL elapsed in the meantime.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{EncryptionManager, SecurityError};
use crate::config::SecurityConfig;

/// A stored credential. The payload is never held in plaintext here.
#[derive(Clone)]
struct SecureCredential {
    credential_id: String,
    environment_id: String,
    credential_type: String,
    encrypted_payload: Vec<u8>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SecureCredential {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn info(&self) -> CredentialInfo {
        CredentialInfo {
            credential_id: self.credential_id.clone(),
            environment_id: self.environment_id.clone(),
            credential_type: self.credential_type.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Credential metadata, safe to log or display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialInfo {
    /// Generated id returned by `store`.
    pub credential_id: String,
    /// Environment the credential belongs to.
    pub environment_id: String,
    /// Free-form kind, e.g. `"ssh_key"` or `"api_token"`.
    pub credential_type: String,
    /// When the credential was stored.
    pub created_at: DateTime<Utc>,
    /// After this instant `retrieve` refuses to decrypt it.
    pub expires_at: DateTime<Utc>,
}

struct CachedValue {
    value: Zeroizing<Vec<u8>>,
    cached_at: Instant,
}

/// Encrypted credential storage with TTLs and a decrypted-value cache.
pub struct CredentialManager {
    encryption: Arc<EncryptionManager>,
    credentials: DashMap<String, SecureCredential>,
    cache: DashMap<String, CachedValue>,
    cache_ttl: Duration,
    default_ttl_hours: u32,
}

impl CredentialManager {
    /// Manager with settings from the `[security]` config section.
    pub fn new(encryption: Arc<EncryptionManager>, config: &SecurityConfig) -> Self {
        Self::with_settings(
            encryption,
            config.credential_cache_ttl(),
            config.default_credential_ttl_hours,
        )
    }

    /// Manager with explicit cache lifetime and default credential TTL.
    pub fn with_settings(
        encryption: Arc<EncryptionManager>,
        cache_ttl: Duration,
        default_ttl_hours: u32,
    ) -> Self {
        Self {
            encryption,
            credentials: DashMap::new(),
            cache: DashMap::new(),
            cache_ttl,
            default_ttl_hours,
        }
    }

    /// Encrypt and store `data`. Returns the generated credential id.
    ///
    /// `ttl_hours` of `None` uses the configured default; `Some(0)` stores a
    /// credential that is already expired.
    pub fn store(
        &self,
        environment_id: &str,
        credential_type: &str,
        data: &[u8],
        ttl_hours: Option<u32>,
    ) -> Result<String, SecurityError> {
        let encrypted_payload = self.encryption.encrypt(data, false)?;
        let credential_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let ttl = ttl_hours.unwrap_or(self.default_ttl_hours);
        let expires_at = created_at + ChronoDuration::hours(i64::from(ttl));

        self.credentials.insert(
            credential_id.clone(),
            SecureCredential {
                credential_id: credential_id.clone(),
                environment_id: environment_id.to_string(),
                credential_type: credential_type.to_string(),
                encrypted_payload,
                created_at,
                expires_at,
            },
        );

        info!(
            credential_id = %credential_id,
            environment_id,
            credential_type,
            ttl_hours = ttl,
            "credential stored"
        );
        Ok(credential_id)
    }

    /// Decrypted credential bytes, or `None` if unknown or expired.
    ///
    /// # Errors
    ///
    /// [`SecurityError::Decryption`] if the stored payload fails to decrypt.
    pub fn retrieve(&self, credential_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, SecurityError> {
        let cached = self.cache.get(credential_id).and_then(|entry| {
            (entry.cached_at.elapsed() < self.cache_ttl).then(|| entry.value.clone())
        });
        if let Some(value) = cached {
            debug!(credential_id, "credential cache hit");
            return Ok(Some(value));
        }
        self.cache.remove(credential_id);

        let Some(credential) = self.credentials.get(credential_id).map(|c| c.value().clone()) else {
            debug!(credential_id, "credential not found");
            return Ok(None);
        };

        if credential.is_expired_at(Utc::now()) {
            debug!(credential_id, expires_at = %credential.expires_at, "credential expired");
            return Ok(None);
        }

        let value = Zeroizing::new(self.encryption.decrypt(&credential.encrypted_payload, false)?);
        self.cache.insert(
            credential_id.to_string(),
            CachedValue {
                value: value.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some(value))
    }

    /// Metadata for one credential, expired or not.
    pub fn info(&self, credential_id: &str) -> Option<CredentialInfo> {
        self.credentials.get(credential_id).map(|c| c.info())
    }

    /// Remove a credential and its cached value. Returns `true` if it existed.
    pub fn delete(&self, credential_id: &str) -> bool {
        self.cache.remove(credential_id);
        let removed = self.credentials.remove(credential_id).is_some();
        if removed {
            info!(credential_id, "credential deleted");
        }
        removed
    }

    /// Drop expired credentials and stale cache entries. Returns how many
    /// credentials were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.credentials.len();
        self.credentials.retain(|_, c| !c.is_expired_at(now));
        let removed = before.saturating_sub(self.credentials.len());

        let ttl = self.cache_ttl;
        self.cache.retain(|_, v| v.cached_at.elapsed() < ttl);

        if removed > 0 {
            info!(removed, "expired credentials removed");
        }
        removed
    }

    /// Metadata of every credential stored for `environment_id`.
    pub fn list_for_environment(&self, environment_id: &str) -> Vec<CredentialInfo> {
        let mut infos: Vec<CredentialInfo> = self
            .credentials
            .iter()
            .filter(|entry| entry.environment_id == environment_id)
            .map(|entry| entry.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Number of stored credentials.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Returns `true` if no credential is stored.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("credentials", &self.credentials.len())
            .field("cached", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}
