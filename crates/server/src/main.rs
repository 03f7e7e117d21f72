mod accounting;
mod api;
mod approvals;
mod bootstrap;
mod deals;
mod health;
mod invoicing;
mod payments;
mod policies;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use dealgate_core::config::{AppConfig, LoadOptions};
use dealgate_core::invoice_pipeline::{AccountingAdapter, InMemoryAccountingAdapter};

use crate::accounting::HttpAccountingAdapter;

fn init_logging(config: &AppConfig) {
    use dealgate_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Now bootstrap using the same config we already loaded
    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    // The HTTP adapter only exists when the integration is configured; the
    // in-memory fake keeps the posting flow alive without it.
    let adapter: Arc<dyn AccountingAdapter> =
        match HttpAccountingAdapter::from_config(&app.config.accounting) {
            Some(adapter) => Arc::new(adapter),
            None => Arc::new(InMemoryAccountingAdapter::new(app.config.accounting.system)),
        };
    let lease_ttl = chrono::Duration::seconds(app.config.idempotency.lease_ttl_secs as i64);

    let routes = Router::new()
        .merge(deals::router(app.db_pool.clone(), app.config.guardrails.clone()))
        .merge(approvals::router(app.db_pool.clone(), app.config.guardrails.clone()))
        .merge(policies::router(app.db_pool.clone(), app.config.guardrails.clone()))
        .merge(invoicing::router(
            app.db_pool.clone(),
            app.config.invoicing.clone(),
            app.config.accounting.system,
            adapter,
            lease_ttl,
        ))
        .merge(payments::router(
            app.db_pool.clone(),
            app.config.payments.callback_secret.clone(),
            app.config.payments.max_retries,
            lease_ttl,
        ));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "dealgate server listening"
    );

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let server = async {
        axum::serve(listener, routes).with_graceful_shutdown(wait_for_shutdown()).await
    };
    let drain_deadline = async {
        wait_for_shutdown().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result?,
        _ = drain_deadline => {
            tracing::warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "in-flight requests did not drain before the deadline"
            );
        }
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "dealgate server stopping"
    );

    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
