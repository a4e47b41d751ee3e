//! Artifact-level protection: sensitivity classification, encryption,
//! and the permission checks the pipeline relies on.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{
    AccessControlManager, AccessControlRule, CredentialManager, EncryptionManager, Permission,
    SecurityError, SecurityLevel,
};
use crate::deployment::{ArtifactType, TestArtifact};

/// Lower-case substrings that mark content as sensitive.
const SENSITIVE_KEYWORDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "key",
    "token",
    "credential",
    "certificate",
    "private",
    "auth",
];

/// Owner grant attached to every artifact this handler secures.
const OWNER_PERMISSIONS: [Permission; 3] = [Permission::Read, Permission::Write, Permission::Deploy];

/// Encrypts sensitive artifacts and gates access to them.
#[derive(Debug, Clone)]
pub struct SecureArtifactHandler {
    encryption: Arc<EncryptionManager>,
    credentials: Arc<CredentialManager>,
    access: Arc<AccessControlManager>,
}

impl SecureArtifactHandler {
    /// Compose a handler from shared managers.
    pub fn new(
        encryption: Arc<EncryptionManager>,
        credentials: Arc<CredentialManager>,
        access: Arc<AccessControlManager>,
    ) -> Self {
        Self {
            encryption,
            credentials,
            access,
        }
    }

    /// Shared credential store.
    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Shared rule store.
    pub fn access(&self) -> &Arc<AccessControlManager> {
        &self.access
    }

    /// Returns `true` if `artifact` must be encrypted at `level`.
    ///
    /// Sensitive means: a level that forces encryption, a config file, or
    /// content mentioning one of the sensitive keywords.
    pub fn is_sensitive(artifact: &TestArtifact, level: SecurityLevel) -> bool {
        if level.requires_encryption() || artifact.artifact_type == ArtifactType::Config {
            return true;
        }
        let text = String::from_utf8_lossy(&artifact.content).to_lowercase();
        SENSITIVE_KEYWORDS.iter().any(|kw| text.contains(kw))
    }

    /// Tag `artifact` with `level` and, if sensitive, encrypt its content and
    /// grant `user_id` read/write/deploy on it.
    ///
    /// Already-encrypted artifacts are returned unchanged.
    pub fn secure(
        &self,
        mut artifact: TestArtifact,
        level: SecurityLevel,
        user_id: &str,
    ) -> Result<TestArtifact, SecurityError> {
        if artifact.is_encrypted {
            return Ok(artifact);
        }
        artifact.security_level = level;
        if !Self::is_sensitive(&artifact, level) {
            debug!(artifact_id = %artifact.artifact_id, level = %level, "artifact not sensitive");
            return Ok(artifact);
        }

        artifact.content = self.encryption.encrypt(&artifact.content, false)?;
        artifact.is_encrypted = true;
        artifact.access_control_enabled = true;
        artifact.metadata.insert("encrypted".into(), "true".into());
        artifact
            .metadata
            .insert("security_level".into(), level.to_string());
        artifact
            .metadata
            .insert("encryption_timestamp".into(), Utc::now().to_rfc3339());

        self.access.add_rule(AccessControlRule::new(
            artifact.artifact_id.clone(),
            user_id,
            OWNER_PERMISSIONS,
        ))?;

        info!(
            artifact_id = %artifact.artifact_id,
            level = %level,
            user_id,
            "artifact encrypted"
        );
        Ok(artifact)
    }

    /// Plaintext copy of `artifact` for `user_id`.
    ///
    /// Unencrypted artifacts come back unchanged. Encrypted ones require a
    /// `read` grant; without it the result is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::Decryption`] if the content fails to decrypt.
    pub fn decrypt(
        &self,
        artifact: &TestArtifact,
        user_id: &str,
    ) -> Result<Option<TestArtifact>, SecurityError> {
        if !artifact.is_encrypted {
            return Ok(Some(artifact.clone()));
        }
        if !self
            .access
            .check(&artifact.artifact_id, user_id, Permission::Read, None)
        {
            warn!(artifact_id = %artifact.artifact_id, user_id, "artifact read refused");
            return Ok(None);
        }

        let mut plain = artifact.clone();
        plain.content = self.encryption.decrypt(&artifact.content, false)?;
        plain.is_encrypted = false;
        plain.metadata.insert("encrypted".into(), "false".into());
        Ok(Some(plain))
    }

    /// Returns `true` if `user_id` may deploy `artifact` to `environment_id`.
    pub fn enforce_deploy_permission(
        &self,
        artifact: &TestArtifact,
        user_id: &str,
        environment_id: &str,
    ) -> bool {
        self.access.check(
            &artifact.artifact_id,
            user_id,
            Permission::Deploy,
            Some(environment_id),
        )
    }

    /// Decrypted credential for connecting to `environment_id`.
    ///
    /// Requires a `read` grant on the credential id for that environment.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::PermissionDenied`] without a grant.
    /// - [`SecurityError::CredentialNotFound`] if unknown or expired.
    pub fn environment_credential(
        &self,
        credential_id: &str,
        user_id: &str,
        environment_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecurityError> {
        if !self
            .access
            .check(credential_id, user_id, Permission::Read, Some(environment_id))
        {
            return Err(SecurityError::PermissionDenied(format!(
                "user {user_id} may not read credential {credential_id} for {environment_id}"
            )));
        }
        self.credentials
            .retrieve(credential_id)?
            .ok_or_else(|| SecurityError::CredentialNotFound(credential_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handler() -> SecureArtifactHandler {
        let encryption = Arc::new(EncryptionManager::generate());
        let credentials = Arc::new(CredentialManager::with_settings(
            encryption.clone(),
            Duration::from_secs(900),
            24,
        ));
        SecureArtifactHandler::new(encryption, credentials, Arc::new(AccessControlManager::new()))
    }

    fn script(content: &str) -> TestArtifact {
        TestArtifact::new("art-1", "run.sh", ArtifactType::Script, content.as_bytes().to_vec(), "/opt/run.sh")
    }

    #[test]
    fn test_classification() {
        assert!(!SecureArtifactHandler::is_sensitive(&script("echo hi"), SecurityLevel::Public));
        assert!(SecureArtifactHandler::is_sensitive(&script("echo hi"), SecurityLevel::Secret));
        assert!(SecureArtifactHandler::is_sensitive(&script("export API_TOKEN=x"), SecurityLevel::Internal));
        let config = TestArtifact::new("c", "app.conf", ArtifactType::Config, b"debug=1".to_vec(), "/etc/app.conf");
        assert!(SecureArtifactHandler::is_sensitive(&config, SecurityLevel::Public));
    }

    #[test]
    fn test_public_artifact_left_in_plaintext() {
        let handler = handler();
        let secured = handler.secure(script("echo hi"), SecurityLevel::Public, "alice").unwrap();
        assert!(!secured.is_encrypted);
        assert_eq!(secured.content, b"echo hi");
        assert_eq!(handler.access().rule_count(), 0);
    }

    #[test]
    fn test_secure_then_decrypt_round_trip() {
        let handler = handler();
        let original = script("echo hi");
        let secured = handler.secure(original.clone(), SecurityLevel::Confidential, "alice").unwrap();

        assert!(secured.is_encrypted);
        assert!(secured.access_control_enabled);
        assert_ne!(secured.content, original.content);
        assert_eq!(secured.metadata.get("encrypted").map(String::as_str), Some("true"));
        assert_eq!(secured.metadata.get("security_level").map(String::as_str), Some("confidential"));
        assert!(secured.metadata.contains_key("encryption_timestamp"));

        let plain = handler.decrypt(&secured, "alice").unwrap().unwrap();
        assert_eq!(plain.content, original.content);
        assert!(plain.checksum_mismatch().is_none());
    }

    #[test]
    fn test_decrypt_refused_without_read_grant() {
        let handler = handler();
        let secured = handler.secure(script("echo hi"), SecurityLevel::Secret, "alice").unwrap();
        assert!(handler.decrypt(&secured, "mallory").unwrap().is_none());
    }

    #[test]
    fn test_secure_is_idempotent_on_encrypted_artifacts() {
        let handler = handler();
        let once = handler.secure(script("echo hi"), SecurityLevel::Secret, "alice").unwrap();
        let twice = handler.secure(once.clone(), SecurityLevel::Secret, "alice").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_owner_may_deploy_anywhere_others_may_not() {
        let handler = handler();
        let secured = handler.secure(script("echo hi"), SecurityLevel::Secret, "alice").unwrap();
        assert!(handler.enforce_deploy_permission(&secured, "alice", "env-1"));
        assert!(!handler.enforce_deploy_permission(&secured, "bob", "env-1"));
    }

    #[test]
    fn test_environment_credential_requires_grant() {
        let handler = handler();
        let id = handler.credentials().store("env-1", "ssh_key", b"key-bytes", None).unwrap();

        assert!(matches!(
            handler.environment_credential(&id, "alice", "env-1"),
            Err(SecurityError::PermissionDenied(_))
        ));

        handler
            .access()
            .add_rule(AccessControlRule::new(id.clone(), "alice", [Permission::Read]).restricted_to(["env-1"]))
            .unwrap();
        let value = handler.environment_credential(&id, "alice", "env-1").unwrap();
        assert_eq!(value.as_slice(), b"key-bytes");
        assert!(handler.environment_credential(&id, "alice", "env-2").is_err());
    }

    #[test]
    fn test_environment_credential_missing_is_not_found() {
        let handler = handler();
        handler
            .access()
            .add_rule(AccessControlRule::new("ghost", "alice", [Permission::Read]))
            .unwrap();
        assert!(matches!(
            handler.environment_credential("ghost", "alice", "env-1"),
            Err(SecurityError::CredentialNotFound(_))
        ));
    }
}
