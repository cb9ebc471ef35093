//! Per-account usage record

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as epoch seconds
pub fn now_timestamp() -> Timestamp {
    Utc::now().timestamp()
}

/// Accounting state for one tracked proxy account.
///
/// `locked` mirrors the operating system's lock state for the account. It is
/// a cache: the enforcer flips it only after the OS call succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    /// Bytes transferred since creation or the last administrative reset
    pub total_usage: u64,
    /// Quota ceiling in bytes, only meaningful while `quota_enabled`
    pub allowed_usage: u64,
    #[serde(default)]
    pub quota_enabled: bool,
    /// Account is usable while `now < expires_at`
    pub expires_at: Timestamp,
    #[serde(default)]
    pub locked: bool,
}

impl UserRecord {
    /// Fresh record with zero usage expiring `expiry_days` from `now`.
    ///
    /// `allowed_usage` of `None` leaves the quota disabled.
    pub fn new(
        username: impl Into<String>,
        now: Timestamp,
        expiry_days: u32,
        allowed_usage: Option<u64>,
    ) -> Self {
        Self {
            username: username.into(),
            total_usage: 0,
            allowed_usage: allowed_usage.unwrap_or(0),
            quota_enabled: allowed_usage.is_some(),
            expires_at: now + Duration::days(i64::from(expiry_days)).num_seconds(),
            locked: false,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn is_over_quota(&self) -> bool {
        self.quota_enabled && self.total_usage >= self.allowed_usage
    }

    /// Whether policy says the account must be locked at `now`
    pub fn should_be_locked(&self, now: Timestamp) -> bool {
        self.is_expired(now) || self.is_over_quota()
    }

    /// Bytes left before the quota trips, `None` when unlimited
    pub fn remaining_usage(&self) -> Option<u64> {
        self.quota_enabled
            .then(|| self.allowed_usage.saturating_sub(self.total_usage))
    }

    /// Apply the supplied fields of `patch`, leaving the others untouched.
    ///
    /// Setting `allowed_usage` without an explicit `quota_enabled` turns the
    /// quota on.
    pub fn apply_patch(&mut self, patch: &QuotaPatch) {
        if let Some(allowed) = patch.allowed_usage {
            self.allowed_usage = allowed;
            self.quota_enabled = true;
        }
        if let Some(enabled) = patch.quota_enabled {
            self.quota_enabled = enabled;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
        if let Some(total) = patch.total_usage {
            self.total_usage = total;
        }
    }
}

/// Partial update of the administrative fields of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPatch {
    #[serde(default)]
    pub allowed_usage: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
    /// Administrative reset of the usage counter
    #[serde(default)]
    pub total_usage: Option<u64>,
    #[serde(default)]
    pub quota_enabled: Option<bool>,
}

impl QuotaPatch {
    pub fn is_empty(&self) -> bool {
        self.allowed_usage.is_none()
            && self.expires_at.is_none()
            && self.total_usage.is_none()
            && self.quota_enabled.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: u64, allowed: u64, expires_at: Timestamp) -> UserRecord {
        UserRecord {
            username: "alice".to_string(),
            total_usage: total,
            allowed_usage: allowed,
            quota_enabled: true,
            expires_at,
            locked: false,
        }
    }

    #[test]
    fn test_new_record_defaults() {
        let rec = UserRecord::new("bob", 1_000, 30, None);
        assert_eq!(rec.total_usage, 0);
        assert!(!rec.quota_enabled);
        assert!(!rec.locked);
        assert_eq!(rec.expires_at, 1_000 + 30 * 86_400);

        let rec = UserRecord::new("bob", 0, 1, Some(500));
        assert!(rec.quota_enabled);
        assert_eq!(rec.allowed_usage, 500);
    }

    #[test]
    fn test_expiry_boundary() {
        let rec = record(0, 100, 500);
        assert!(!rec.is_expired(499));
        assert!(rec.is_expired(500));
        assert!(rec.is_expired(501));
    }

    #[test]
    fn test_quota_disabled_is_unlimited() {
        let mut rec = record(1_000_000, 0, i64::MAX);
        rec.quota_enabled = false;
        assert!(!rec.is_over_quota());
        assert_eq!(rec.remaining_usage(), None);

        rec.quota_enabled = true;
        assert!(rec.is_over_quota());
        assert_eq!(rec.remaining_usage(), Some(0));
    }

    #[test]
    fn test_apply_patch_only_touches_supplied_fields() {
        let mut rec = record(50, 100, 2_000);
        rec.quota_enabled = false;

        rec.apply_patch(&QuotaPatch {
            expires_at: Some(3_000),
            ..Default::default()
        });
        assert_eq!(rec.expires_at, 3_000);
        assert_eq!(rec.allowed_usage, 100);
        assert!(!rec.quota_enabled);

        rec.apply_patch(&QuotaPatch {
            allowed_usage: Some(10),
            total_usage: Some(0),
            ..Default::default()
        });
        assert_eq!(rec.allowed_usage, 10);
        assert!(rec.quota_enabled);
        assert_eq!(rec.total_usage, 0);
    }

    #[test]
    fn test_camel_case_serialization() {
        let rec = record(1, 2, 3);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["totalUsage"], 1);
        assert_eq!(json["allowedUsage"], 2);
        assert_eq!(json["expiresAt"], 3);
        assert_eq!(json["quotaEnabled"], true);

        let patch: QuotaPatch = serde_json::from_str(r#"{"allowedUsage": 7}"#).unwrap();
        assert_eq!(patch.allowed_usage, Some(7));
        assert!(!patch.is_empty());
        assert!(QuotaPatch::default().is_empty());
    }
}
