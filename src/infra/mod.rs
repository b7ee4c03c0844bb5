use crate::{adapters::persistence::PostgresPersistence, infra::db::init_db};

pub mod app;
pub mod balance_audit_worker;
pub mod config;
pub mod db;
pub mod event_relay_worker;
pub mod event_signer;
pub mod expiry_check_worker;
pub mod setup;
pub mod webhook_verifier;

pub async fn postgres_persistence(database_url: &str) -> anyhow::Result<PostgresPersistence> {
    let pool = init_db(database_url).await?;
    let persistence = PostgresPersistence::new(pool);
    Ok(persistence)
}
