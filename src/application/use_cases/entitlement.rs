use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::subscription::SubscriptionProfile;

pub const DEFAULT_ENTITLED_STATUSES: &[&str] = &["active", "trialing", "paid"];
pub const DEFAULT_GRANT_PER_PERIOD: i64 = 10;
pub const DEFAULT_ROLLOVER_LIMIT: i64 = 100;

/// Maps provider status vocabulary onto entitlement and carries the credit
/// defaults applied when a subscription does not specify its own.
#[derive(Debug, Clone)]
pub struct EntitlementPolicy {
    entitled_statuses: HashSet<String>,
    pub default_grant_per_period: i64,
    pub default_rollover_limit: i64,
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_ENTITLED_STATUSES.iter().copied(),
            DEFAULT_GRANT_PER_PERIOD,
            DEFAULT_ROLLOVER_LIMIT,
        )
    }
}

impl EntitlementPolicy {
    pub fn new<I, S>(entitled_statuses: I, default_grant_per_period: i64, default_rollover_limit: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entitled_statuses: entitled_statuses
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            default_grant_per_period,
            default_rollover_limit,
        }
    }

    pub fn is_entitled_status(&self, status: &str) -> bool {
        self.entitled_statuses.contains(&status.to_lowercase())
    }

    /// No tracked period end means the period never lapses.
    pub fn is_period_valid(current_period_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match current_period_end {
            Some(end) => end > now,
            None => true,
        }
    }

    pub fn grants_access(&self, subscription: &SubscriptionProfile, now: DateTime<Utc>) -> bool {
        self.is_entitled_status(&subscription.status)
            && Self::is_period_valid(subscription.current_period_end, now)
    }

    /// A user is entitled when any of their subscriptions grants access.
    pub fn has_entitlement(&self, subscriptions: &[SubscriptionProfile], now: DateTime<Utc>) -> bool {
        subscriptions.iter().any(|s| self.grants_access(s, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_subscription;
    use chrono::Duration;

    #[test]
    fn entitled_statuses_are_exactly_active_trialing_paid() {
        let policy = EntitlementPolicy::default();
        for status in ["active", "trialing", "paid", "ACTIVE", "Trialing", "PAID"] {
            assert!(policy.is_entitled_status(status), "{status}");
        }
        for status in [
            "",
            "canceled",
            "past_due",
            "incomplete",
            "incomplete_expired",
            "unpaid",
            "updated",
            "activ",
            " active",
        ] {
            assert!(!policy.is_entitled_status(status), "{status:?}");
        }
    }

    #[test]
    fn custom_status_set_replaces_defaults() {
        let policy = EntitlementPolicy::new(["Active", " past_due ", ""], 5, 50);
        assert!(policy.is_entitled_status("past_due"));
        assert!(policy.is_entitled_status("active"));
        assert!(!policy.is_entitled_status("trialing"));
        assert!(!policy.is_entitled_status(""));
        assert_eq!(policy.default_grant_per_period, 5);
        assert_eq!(policy.default_rollover_limit, 50);
    }

    #[test]
    fn period_validity() {
        let now = Utc::now();
        assert!(EntitlementPolicy::is_period_valid(None, now));
        assert!(EntitlementPolicy::is_period_valid(Some(now + Duration::seconds(1)), now));
        assert!(!EntitlementPolicy::is_period_valid(Some(now), now));
        assert!(!EntitlementPolicy::is_period_valid(Some(now - Duration::days(1)), now));
    }

    #[test]
    fn any_valid_subscription_entitles() {
        let policy = EntitlementPolicy::default();
        let now = Utc::now();
        let expired = create_test_subscription(|s| {
            s.status = "active".into();
            s.current_period_end = Some(now - Duration::days(1));
        });
        let canceled = create_test_subscription(|s| s.status = "canceled".into());
        let trialing = create_test_subscription(|s| {
            s.status = "trialing".into();
            s.current_period_end = Some(now + Duration::days(7));
        });

        assert!(!policy.has_entitlement(&[], now));
        assert!(!policy.has_entitlement(&[expired.clone(), canceled.clone()], now));
        assert!(policy.has_entitlement(&[expired, canceled, trialing], now));
    }
}
