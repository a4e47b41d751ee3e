//! Rule-based access control.
//!
//! A rule grants a user a set of [`Permission`]s on one resource, optionally
//! limited to some environments, some UTC hours/weekdays, and an expiry.
//! Several rules may exist per resource; access is granted if any one of
//! them matches.
//!
//! Environment matching, per rule:
//! - no restrictions: any environment (or none) matches
//! - restrictions present, environment given: it must be listed
//! - restrictions present, environment omitted: only [`Permission::Read`] matches

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use super::SecurityError;

/// Operations a rule may grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read (and decrypt) the resource.
    Read,
    /// Modify the resource.
    Write,
    /// Execute the resource on a target.
    Execute,
    /// Deploy the resource to an environment.
    Deploy,
}

impl Permission {
    /// Parse `"read"`, `"write"`, `"execute"` or `"deploy"`.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "execute" => Some(Self::Execute),
            "deploy" => Some(Self::Deploy),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
            Self::Deploy => write!(f, "deploy"),
        }
    }
}

/// Allowed UTC hours (0-23) and weekdays (0 = Monday .. 6 = Sunday).
/// An empty list places no restriction on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRestrictions {
    /// Hours of the day during which access is allowed.
    #[serde(default)]
    pub allowed_hours: Vec<u32>,
    /// Days of the week during which access is allowed.
    #[serde(default)]
    pub allowed_days: Vec<u32>,
}

impl TimeRestrictions {
    /// Returns `true` if `at` falls inside the allowed hours and days.
    pub fn allows(&self, at: DateTime<Utc>) -> bool {
        let hour_ok = self.allowed_hours.is_empty() || self.allowed_hours.contains(&at.hour());
        let day_ok = self.allowed_days.is_empty()
            || self
                .allowed_days
                .contains(&at.weekday().num_days_from_monday());
        hour_ok && day_ok
    }
}

/// One grant of permissions on a resource to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlRule {
    /// Artifact or credential id the rule applies to.
    pub resource_id: String,
    /// User the rule grants access to.
    pub user_id: String,
    /// Granted operations.
    pub permissions: Vec<Permission>,
    /// Environments the grant is limited to; empty means unrestricted.
    #[serde(default)]
    pub environment_restrictions: Vec<String>,
    /// Optional time-of-access window.
    #[serde(default)]
    pub time_restrictions: Option<TimeRestrictions>,
    /// After this instant the rule grants nothing.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessControlRule {
    /// Unrestricted, non-expiring rule.
    pub fn new(
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            permissions: permissions.into_iter().collect(),
            environment_restrictions: Vec::new(),
            time_restrictions: None,
            expires_at: None,
        }
    }

    /// Limit the rule to these environments.
    pub fn restricted_to<S: Into<String>>(mut self, environments: impl IntoIterator<Item = S>) -> Self {
        self.environment_restrictions = environments.into_iter().map(Into::into).collect();
        self
    }

    /// Limit the rule to a time window.
    pub fn during(mut self, window: TimeRestrictions) -> Self {
        self.time_restrictions = Some(window);
        self
    }

    /// Expire the rule at `at`.
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Returns `true` if the rule has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    fn environment_matches(&self, permission: Permission, environment_id: Option<&str>) -> bool {
        if self.environment_restrictions.is_empty() {
            return true;
        }
        match environment_id {
            Some(env) => self.environment_restrictions.iter().any(|e| e == env),
            None => permission == Permission::Read,
        }
    }

    /// Returns `true` if this rule alone grants `permission` at `now`.
    pub fn grants(
        &self,
        permission: Permission,
        environment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        !self.is_expired_at(now)
            && self.permissions.contains(&permission)
            && self.environment_matches(permission, environment_id)
            && self
                .time_restrictions
                .as_ref()
                .map_or(true, |window| window.allows(now))
    }

    fn validate(&self) -> Result<(), SecurityError> {
        if self.resource_id.is_empty() {
            return Err(SecurityError::InvalidRule("resource_id is empty".into()));
        }
        if self.user_id.is_empty() {
            return Err(SecurityError::InvalidRule("user_id is empty".into()));
        }
        if self.permissions.is_empty() {
            return Err(SecurityError::InvalidRule("rule grants no permissions".into()));
        }
        if let Some(window) = &self.time_restrictions {
            if let Some(hour) = window.allowed_hours.iter().find(|h| **h > 23) {
                return Err(SecurityError::InvalidRule(format!("hour {hour} out of range 0-23")));
            }
            if let Some(day) = window.allowed_days.iter().find(|d| **d > 6) {
                return Err(SecurityError::InvalidRule(format!("day {day} out of range 0-6")));
            }
        }
        Ok(())
    }
}

/// Store of access rules keyed by resource id.
#[derive(Debug, Default)]
pub struct AccessControlManager {
    rules: DashMap<String, Vec<AccessControlRule>>,
}

impl AccessControlManager {
    /// Empty rule set: everything is denied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule.
    ///
    /// # Errors
    ///
    /// [`SecurityError::InvalidRule`] for empty ids, an empty permission list,
    /// or out-of-range hours/days.
    pub fn add_rule(&self, rule: AccessControlRule) -> Result<(), SecurityError> {
        rule.validate()?;
        debug!(
            resource_id = %rule.resource_id,
            user_id = %rule.user_id,
            permissions = ?rule.permissions,
            "access rule added"
        );
        self.rules
            .entry(rule.resource_id.clone())
            .or_default()
            .push(rule);
        Ok(())
    }

    /// Check access at the current time.
    pub fn check(
        &self,
        resource_id: &str,
        user_id: &str,
        permission: Permission,
        environment_id: Option<&str>,
    ) -> bool {
        self.check_at(resource_id, user_id, permission, environment_id, Utc::now())
    }

    /// Check access as of `now`.
    pub fn check_at(
        &self,
        resource_id: &str,
        user_id: &str,
        permission: Permission,
        environment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let granted = self.rules.get(resource_id).is_some_and(|rules| {
            rules
                .iter()
                .filter(|rule| rule.user_id == user_id)
                .any(|rule| rule.grants(permission, environment_id, now))
        });

        if !granted {
            debug!(
                resource_id,
                user_id,
                permission = %permission,
                environment_id = environment_id.unwrap_or("-"),
                "access denied"
            );
        }
        granted
    }

    /// Union of permissions granted to `user_id` by unexpired rules, sorted.
    pub fn user_permissions(&self, resource_id: &str, user_id: &str) -> Vec<Permission> {
        let now = Utc::now();
        let mut permissions: Vec<Permission> = self
            .rules
            .get(resource_id)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|rule| rule.user_id == user_id && !rule.is_expired_at(now))
                    .flat_map(|rule| rule.permissions.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        permissions.sort();
        permissions.dedup();
        permissions
    }

    /// Drop every rule for `user_id` on `resource_id`. Returns how many were removed.
    pub fn revoke(&self, resource_id: &str, user_id: &str) -> usize {
        let mut removed = 0;
        if let Some(mut rules) = self.rules.get_mut(resource_id) {
            let before = rules.len();
            rules.retain(|rule| rule.user_id != user_id);
            removed = before - rules.len();
        }
        self.rules.remove_if(resource_id, |_, rules| rules.is_empty());
        if removed > 0 {
            info!(resource_id, user_id, removed, "access revoked");
        }
        removed
    }

    /// Drop expired rules. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for mut entry in self.rules.iter_mut() {
            let before = entry.len();
            entry.retain(|rule| !rule.is_expired_at(now));
            removed += before - entry.len();
        }
        self.rules.retain(|_, rules| !rules.is_empty());
        if removed > 0 {
            debug!(removed, "expired access rules removed");
        }
        removed
    }

    /// Total number of stored rules.
    pub fn rule_count(&self) -> usize {
        self.rules.iter().map(|entry| entry.len()).sum()
    }
}
