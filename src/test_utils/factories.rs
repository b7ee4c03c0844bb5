//! Test data factories. Each returns a complete, valid object; use the
//! closure to override fields.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::use_cases::subscription::SubscriptionProfile;

/// Active subscription with a period ending in 30 days and an empty balance.
pub fn create_test_subscription(overrides: impl FnOnce(&mut SubscriptionProfile)) -> SubscriptionProfile {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let mut subscription = SubscriptionProfile {
        id,
        user_id: "user_test".to_string(),
        provider_customer_id: Some("cus_test".to_string()),
        provider_subscription_id: Some(format!("sub_{}", id.simple())),
        status: "active".to_string(),
        current_period_end: Some(now + Duration::days(30)),
        trial_ends_at: None,
        cancel_at: None,
        canceled_at: None,
        product_id: Some("prod_test".to_string()),
        price_id: None,
        plan_code: Some("pro".to_string()),
        seats: None,
        metadata: None,
        credits_grant_per_period: 10,
        credits_rollover_limit: 100,
        credits_balance: 0,
        last_grant_cursor: None,
        created_at: now,
        updated_at: now,
    };
    overrides(&mut subscription);
    subscription
}
