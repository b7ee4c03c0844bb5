use serde::Serialize;

/// Why the reconciliation workflow is granting credits, derived from the
/// billing event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantTrigger {
    Initial,
    Periodic,
}

impl GrantTrigger {
    /// `subscription.created` grants as initial. Renewals (`subscription.renew*`,
    /// `order.created`, `order.paid`, `invoice.paid`) and any other event that
    /// reaches the grant step grant as periodic; the idempotency key keeps
    /// each period to one grant either way.
    pub fn from_event_type(event_type: &str) -> Self {
        if event_type.to_lowercase().contains("subscription.created") {
            GrantTrigger::Initial
        } else {
            GrantTrigger::Periodic
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            GrantTrigger::Initial => "initial-grant",
            GrantTrigger::Periodic => "periodic-grant",
        }
    }
}
