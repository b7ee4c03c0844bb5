pub mod billing_event;
pub mod grant_trigger;
pub mod ledger_entry_kind;
pub mod polar_webhook;
