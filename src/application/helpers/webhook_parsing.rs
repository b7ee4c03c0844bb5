use serde_json::Value as JsonValue;
use thiserror::Error;
use validator::Validate;

use crate::domain::entities::polar_webhook::{
    BillingEntity, OrderPayload, ParsedEvent, SubscriptionPayload, WebhookEnvelope,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed webhook envelope: {0}")]
    MalformedEnvelope(String),

    #[error("no subscription or order in event {event_type}")]
    UnrecognizedEntity { event_type: String },
}

/// Which entity the event type names, when it names one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityTag {
    Subscription,
    Order,
    Unknown,
}

impl EntityTag {
    fn from_event_type(event_type: &str) -> Self {
        let lowered = event_type.to_lowercase();
        if lowered.starts_with("subscription.") {
            EntityTag::Subscription
        } else if lowered.starts_with("order.") || lowered.starts_with("invoice.") {
            EntityTag::Order
        } else {
            EntityTag::Unknown
        }
    }
}

/// Validate the `{id, type, data}` envelope shape.
pub fn parse_envelope(raw: &JsonValue) -> Result<WebhookEnvelope, ParseError> {
    let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| ParseError::MalformedEnvelope(e.to_string()))?;
    envelope
        .validate()
        .map_err(|e| ParseError::MalformedEnvelope(e.to_string()))?;
    if !envelope.data.is_object() {
        return Err(ParseError::MalformedEnvelope("data must be an object".into()));
    }
    Ok(envelope)
}

/// Decide which billing entity the envelope carries.
///
/// The event type picks the entity when it names one. Anything else falls
/// back to shape probing: `id` + `status` is a subscription, `id` alone an
/// order.
pub fn parse_webhook_event(envelope: WebhookEnvelope) -> Result<ParsedEvent, ParseError> {
    let tag = EntityTag::from_event_type(&envelope.event_type);
    let data = &envelope.data;

    let entity = match tag {
        EntityTag::Subscription => parse_subscription(data).map(BillingEntity::Subscription),
        EntityTag::Order => parse_order(data),
        EntityTag::Unknown => parse_subscription(data)
            .map(BillingEntity::Subscription)
            .or_else(|| parse_order(data)),
    };

    let entity = entity.ok_or_else(|| ParseError::UnrecognizedEntity {
        event_type: envelope.event_type.clone(),
    })?;

    Ok(ParsedEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        entity,
    })
}

pub fn parse_raw_event(raw: &JsonValue) -> Result<ParsedEvent, ParseError> {
    parse_webhook_event(parse_envelope(raw)?)
}

fn parse_subscription(data: &JsonValue) -> Option<SubscriptionPayload> {
    let payload: SubscriptionPayload = serde_json::from_value(data.clone()).ok()?;
    payload.validate().ok()?;
    Some(payload)
}

fn parse_order(data: &JsonValue) -> Option<BillingEntity> {
    let order: OrderPayload = serde_json::from_value(data.clone()).ok()?;
    order.validate().ok()?;
    let subscription = order.subscription.as_ref().and_then(parse_subscription);
    Some(BillingEntity::Order {
        order,
        subscription,
    })
}
