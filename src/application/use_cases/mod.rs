pub mod credits;
pub mod entitlement;
pub mod event_relay;
pub mod ledger;
pub mod reconciliation;
pub mod subscription;
