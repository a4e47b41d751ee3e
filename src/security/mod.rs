//! # Security Layer
//!
//! ## Responsibility
//! Protect artifact payloads and environment credentials at rest, and decide
//! who may read or deploy them.
//!
//! ```text
//! EncryptionManager ──► CredentialManager ─┐
//!          │                               ├──► SecureArtifactHandler
//!          └──────────► AccessControlManager ┘
//! ```
//!
//! ## Guarantees
//! - Raw key material never leaves [`EncryptionManager`]
//! - Decrypted credential bytes live in zeroizing buffers
//! - Nothing in this module logs payload or credential contents
//!
//! ## NOT Responsible For
//! - Key distribution or rotation
//! - Identity/authentication of `user_id` values (callers are trusted)

pub mod access;
pub mod artifacts;
pub mod credentials;
pub mod encryption;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use access::{AccessControlManager, AccessControlRule, Permission, TimeRestrictions};
pub use artifacts::SecureArtifactHandler;
pub use credentials::{CredentialInfo, CredentialManager};
pub use encryption::EncryptionManager;

/// Errors raised by the security layer.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Encrypting a payload failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decrypting a payload failed (wrong key, tampered or truncated data).
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Deriving a key from a password failed.
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// No credential is stored under this id.
    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    /// An access check refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A rule was rejected by `add_rule`.
    #[error("invalid access rule: {0}")]
    InvalidRule(String),
}

/// Artifact sensitivity tag. `Confidential` and `Secret` are always encrypted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// No protection required.
    #[default]
    Public,
    /// Internal use; encrypted only if the content looks sensitive.
    Internal,
    /// Always encrypted.
    Confidential,
    /// Always encrypted.
    Secret,
}

impl SecurityLevel {
    /// Returns `true` for levels that force encryption.
    pub fn requires_encryption(self) -> bool {
        matches!(self, Self::Confidential | Self::Secret)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Internal => write!(f, "internal"),
            Self::Confidential => write!(f, "confidential"),
            Self::Secret => write!(f, "secret"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_confidential_and_secret_force_encryption() {
        assert!(!SecurityLevel::Public.requires_encryption());
        assert!(!SecurityLevel::Internal.requires_encryption());
        assert!(SecurityLevel::Confidential.requires_encryption());
        assert!(SecurityLevel::Secret.requires_encryption());
    }

    #[test]
    fn test_security_level_serializes_snake_case() {
        let json = serde_json::to_string(&SecurityLevel::Confidential).expect("serialize");
        assert_eq!(json, "\"confidential\"");
        assert_eq!(SecurityLevel::Secret.to_string(), "secret");
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = SecurityError::CredentialNotFound("cred-9".into());
        assert!(err.to_string().contains("cred-9"));
    }
}
