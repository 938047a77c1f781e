//! Quote-to-cash service entry point.

use quote_to_cash_service::config::QuoteToCashConfig;
use quote_to_cash_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = QuoteToCashConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        otlp_endpoint = ?config.otlp_endpoint,
        "Starting quote-to-cash-service"
    );

    // Database URL is masked; only the store kind is logged.
    let ledger_store = if config.database.is_memory() {
        "memory"
    } else {
        "postgres"
    };
    tracing::info!(
        service_name = %config.service_name,
        http_port = %config.common.port,
        ledger_store = ledger_store,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        notification_service_url = %config.collaborators.notification_service_url,
        renderer_service_url = %config.collaborators.renderer_service_url,
        downstream_timeout_secs = %config.collaborators.timeout_secs,
        share_link_days = %config.lifecycle.share_link_days,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Application error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
