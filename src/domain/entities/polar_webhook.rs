//! Billing-provider webhook payload shapes.
//!
//! The provider sends loosely-typed JSON whose `data` object is either a
//! subscription or an order. These types capture only the fields the ledger
//! needs; everything else is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};
use validator::Validate;

/// Canonical `{id, type, data}` shape handed over by the webhook receiver.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WebhookEnvelope {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub event_type: String,
    pub data: JsonValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerRef {
    pub id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubscriptionPayload {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub status: String,
    pub customer_id: Option<String>,
    pub customer: Option<CustomerRef>,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, JsonValue>>,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, alias = "trial_end", deserialize_with = "flexible_timestamp")]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "ends_at", deserialize_with = "flexible_timestamp")]
    pub cancel_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub canceled_at: Option<DateTime<Utc>>,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product: Option<ProductRef>,
    #[serde(alias = "planCode")]
    pub plan_code: Option<String>,
    pub seats: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OrderPayload {
    #[validate(length(min = 1))]
    pub id: String,
    pub status: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription: Option<JsonValue>,
    pub customer_id: Option<String>,
    pub customer: Option<CustomerRef>,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, JsonValue>>,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product: Option<ProductRef>,
}

impl SubscriptionPayload {
    pub fn metadata_user_id(&self) -> Option<&str> {
        user_id_from_metadata(self.metadata.as_ref())
    }

    pub fn customer_email(&self) -> Option<&str> {
        customer_email(self.customer.as_ref(), self.customer_email.as_deref())
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id
            .as_deref()
            .or_else(|| self.customer.as_ref().and_then(|c| c.id.as_deref()))
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id
            .as_deref()
            .or_else(|| self.product.as_ref().and_then(|p| p.id.as_deref()))
    }

    pub fn plan_code(&self) -> Option<&str> {
        self.plan_code
            .as_deref()
            .or_else(|| self.product.as_ref().and_then(|p| p.name.as_deref()))
    }
}

impl OrderPayload {
    pub fn metadata_user_id(&self) -> Option<&str> {
        user_id_from_metadata(self.metadata.as_ref())
    }

    pub fn customer_email(&self) -> Option<&str> {
        customer_email(self.customer.as_ref(), self.customer_email.as_deref())
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id
            .as_deref()
            .or_else(|| self.customer.as_ref().and_then(|c| c.id.as_deref()))
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id
            .as_deref()
            .or_else(|| self.product.as_ref().and_then(|p| p.id.as_deref()))
    }
}

/// The entity a webhook carries, decided once at parse time.
#[derive(Debug, Clone)]
pub enum BillingEntity {
    Subscription(SubscriptionPayload),
    /// An order, with the embedded subscription when the provider inlines one.
    Order {
        order: OrderPayload,
        subscription: Option<SubscriptionPayload>,
    },
}

#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub id: String,
    pub event_type: String,
    pub entity: BillingEntity,
}

fn user_id_from_metadata(metadata: Option<&Map<String, JsonValue>>) -> Option<&str> {
    let metadata = metadata?;
    ["userId", "user_id"]
        .iter()
        .filter_map(|key| metadata.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn customer_email<'a>(customer: Option<&'a CustomerRef>, flat: Option<&'a str>) -> Option<&'a str> {
    customer
        .and_then(|c| c.email.as_deref())
        .or(flat)
        .map(str::trim)
        .filter(|email| !email.is_empty())
}

/// Values above this are epoch milliseconds, below it epoch seconds.
const EPOCH_MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Accepts RFC 3339 strings and epoch numbers. Unparsable values become `None`
/// rather than failing the whole event.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_json))
}

pub fn timestamp_from_json(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw.abs() >= EPOCH_MS_THRESHOLD {
                DateTime::<Utc>::from_timestamp_millis(raw)
            } else {
                DateTime::<Utc>::from_timestamp(raw, 0)
            }
        }
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
