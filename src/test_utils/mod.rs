//! Test utilities.
//!
//! - In-memory implementations of the repository and port traits
//! - Fixture factories
//! - An `AppState` builder for HTTP route tests

mod app_state_builder;
mod credit_mocks;
mod event_mocks;
mod factories;

pub use app_state_builder::*;
pub use credit_mocks::*;
pub use event_mocks::*;
pub use factories::*;
