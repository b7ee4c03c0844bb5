use dotenvy::dotenv;
use tracing::info;

use credit_ledger::infra::{
    app::create_app,
    balance_audit_worker::run_balance_audit_loop,
    event_relay_worker::{EventBusTarget, run_event_relay_loop},
    expiry_check_worker::run_expiry_check_loop,
    setup::init_app_state,
};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let app_state = init_app_state().await?;

    let bind_addr = app_state.config.bind_addr;

    let app = create_app(app_state.clone());

    // Background workers start after tracing is initialized
    let config = app_state.config.clone();
    tokio::spawn(run_expiry_check_loop(
        app_state.reconciliation_use_cases.clone(),
        app_state.expiry_queue.clone(),
        config.expiry_worker_poll_secs,
    ));
    tokio::spawn(run_balance_audit_loop(
        app_state.ledger_use_cases.clone(),
        config.balance_audit_interval_secs,
    ));
    match config.event_bus_url.clone() {
        Some(url) => {
            let target = EventBusTarget {
                url,
                signing_key: config.event_bus_signing_key.clone(),
            };
            tokio::spawn(run_event_relay_loop(
                app_state.event_relay_use_cases.clone(),
                target,
                config.event_relay_poll_secs,
            ));
        }
        None => info!("EVENT_BUS_URL not set, outbox events stay pending"),
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Backend listening at {}", &listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
