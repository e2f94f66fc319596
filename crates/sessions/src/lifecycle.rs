//! Session lifecycle policy.
//!
//! A session is terminated after a fixed period of inactivity. The policy is
//! evaluated by the store's periodic sweep; clearing a session explicitly
//! terminates it immediately.

use chrono::{DateTime, Duration, Utc};

/// Idle-timeout policy for hot-tier sessions.
#[derive(Debug, Clone, Copy)]
pub struct IdlePolicy {
    pub idle_minutes: u64,
}

impl IdlePolicy {
    /// Whether a session last active at `last_activity` has expired at `now`.
    pub fn is_expired(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_activity) >= Duration::minutes(self.idle_minutes as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_expired_before_threshold() {
        let policy = IdlePolicy { idle_minutes: 30 };
        let now = Utc::now();
        assert!(!policy.is_expired(now - Duration::minutes(29), now));
    }

    #[test]
    fn expired_at_threshold() {
        let policy = IdlePolicy { idle_minutes: 30 };
        let now = Utc::now();
        assert!(policy.is_expired(now - Duration::minutes(30), now));
        assert!(policy.is_expired(now - Duration::hours(2), now));
    }

    #[test]
    fn future_activity_never_expires() {
        let policy = IdlePolicy { idle_minutes: 30 };
        let now = Utc::now();
        assert!(!policy.is_expired(now + Duration::minutes(5), now));
    }
}
