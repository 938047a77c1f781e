//! Application startup and lifecycle management.

use crate::config::QuoteToCashConfig;
use crate::handlers::{change_orders, commissions, contracts, health, invoices, payments, quotes};
use crate::services::metrics::init_metrics;
use crate::services::notification::{HttpNotificationDispatcher, LogNotificationDispatcher};
use crate::services::renderer::{DisabledRenderer, HttpDocumentRenderer};
use crate::services::{
    Database, DocumentRenderer, LedgerStore, MemoryLedgerStore, NotificationDispatcher,
    QuoteToCash,
};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: QuoteToCashConfig,
    pub lifecycle: QuoteToCash,
}

impl AppState {
    pub fn new(
        config: QuoteToCashConfig,
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        let lifecycle = QuoteToCash::new(store, dispatcher, renderer, &config.lifecycle_settings());
        Self { config, lifecycle }
    }
}

/// Routes called by the signing page in the customer's browser.
fn public_routes(config: &QuoteToCashConfig) -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = match config.lifecycle.public_base_url.parse::<HeaderValue>() {
        Ok(origin) => cors.allow_origin(origin),
        Err(e) => {
            tracing::warn!(error = %e, "PUBLIC_BASE_URL is not a valid origin; CORS disabled");
            cors
        }
    };

    Router::new()
        .route("/quotes/sign", post(quotes::sign_quote_as_customer))
        .route(
            "/change-orders/sign",
            post(change_orders::sign_change_order_as_customer),
        )
        .layer(cors)
}

fn company_routes() -> Router<AppState> {
    Router::new()
        .route("/quotes", post(quotes::create_quote))
        .route(
            "/quotes/:id",
            get(quotes::get_quote).delete(quotes::delete_quote),
        )
        .route("/quotes/:id/line-items", put(quotes::replace_line_items))
        .route("/quotes/:id/send-email", post(quotes::send_quote))
        .route("/quotes/:id/sign-company", post(quotes::sign_quote_as_company))
        .route("/quotes/:id/contracts", get(quotes::list_contracts))
        .route("/contracts/:id/void", post(contracts::void_contract))
        .route("/change-orders", post(change_orders::propose_change_order))
        .route("/change-orders/:id", get(change_orders::get_change_order))
        .route(
            "/change-orders/:id/send-email",
            post(change_orders::send_change_order),
        )
        .route(
            "/change-orders/:id/sign-company",
            post(change_orders::sign_change_order_as_company),
        )
        .route(
            "/change-orders/:id/reject",
            post(change_orders::reject_change_order),
        )
        .route("/invoices/create", post(invoices::create_invoice))
        .route("/invoices/:id", get(invoices::get_invoice))
        .route("/invoices/:id/send-email", post(invoices::send_invoice))
        .route("/invoices/:id/cancel", post(invoices::cancel_invoice))
        .route("/invoices/:id/payments", post(payments::record_payment))
        .route("/payments/:id/clear", post(payments::clear_payment))
        .route("/payments/:id", delete(payments::delete_payment))
        .route(
            "/leads/:id/commissions",
            post(commissions::assign_commission).get(commissions::list_commissions),
        )
        .route(
            "/leads/:id/commissions/evaluate",
            post(commissions::evaluate_commissions),
        )
}

/// Full HTTP surface with the shared middleware stack.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .merge(company_routes())
        .merge(public_routes(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn dispatcher(config: &QuoteToCashConfig) -> Result<Arc<dyn NotificationDispatcher>, AppError> {
    let url = config.collaborators.notification_service_url.trim();
    if url.is_empty() {
        tracing::info!("Notification service URL not configured - notifications will be logged only");
        return Ok(Arc::new(LogNotificationDispatcher));
    }
    let timeout = Duration::from_secs(config.collaborators.timeout_secs);
    let dispatcher = HttpNotificationDispatcher::new(url, timeout).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid notification service client: {}", e))
    })?;
    Ok(Arc::new(dispatcher))
}

fn renderer(config: &QuoteToCashConfig) -> Result<Arc<dyn DocumentRenderer>, AppError> {
    let url = config.collaborators.renderer_service_url.trim();
    if url.is_empty() {
        tracing::info!("Renderer service URL not configured - documents will be sent without PDFs");
        return Ok(Arc::new(DisabledRenderer));
    }
    let timeout = Duration::from_secs(config.collaborators.timeout_secs);
    let renderer = HttpDocumentRenderer::new(url, timeout).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid renderer service client: {}", e))
    })?;
    Ok(Arc::new(renderer))
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: QuoteToCashConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: QuoteToCashConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: QuoteToCashConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = if config.database.is_memory() {
            tracing::warn!("Using in-memory ledger store - data will not survive a restart");
            Arc::new(MemoryLedgerStore::new())
        } else {
            let db = Database::new(
                config.database.url.expose_secret(),
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;

            if run_migrations {
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
            }
            Arc::new(db)
        };

        let dispatcher = dispatcher(&config)?;
        let renderer = renderer(&config)?;
        let state = AppState::new(config.clone(), store, dispatcher, renderer);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Quote-to-cash service listener bound");

        Ok(Self {
            http_port,
            listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "quote-to-cash-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
