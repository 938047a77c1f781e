//! Common test utilities for quote-to-cash-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use quote_to_cash_service::config::{
    CollaboratorConfig, DatabaseConfig, LifecycleConfig, QuoteToCashConfig, MEMORY_DATABASE_URL,
};
use quote_to_cash_service::models::{
    ChangeOrder, Contract, ContractStatus, LineItemInput, Quote, SignaturePayload,
};
use quote_to_cash_service::services::notification::{DispatchError, Notification};
use quote_to_cash_service::services::renderer::DisabledRenderer;
use quote_to_cash_service::services::invoices::InvoiceDetail;
use quote_to_cash_service::services::{
    CreateInvoice, CreateQuote, Database, LedgerStore, MemoryLedgerStore, NotificationDispatcher,
    ProposeChangeOrder, QuoteToCash,
};
use quote_to_cash_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,quote_to_cash_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const SIGNATURE_IMAGE: &str = "data:image/png;base64,iVBORw0KGgo=";

/// Keeps every notification handed to it.
#[derive(Default)]
pub struct RecordingNotificationDispatcher {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotificationDispatcher {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.subject).collect()
    }

    /// Subjects once at least `count` notifications arrived. Executed
    /// documents are delivered from background tasks.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.subjects()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotificationDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Rejects every notification.
pub struct FailingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for FailingNotificationDispatcher {
    async fn send(&self, _notification: &Notification) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("503 Service Unavailable".to_string()))
    }
}

pub fn test_config() -> QuoteToCashConfig {
    QuoteToCashConfig {
        common: CommonConfig { port: 0 },
        service_name: "quote-to-cash-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new(MEMORY_DATABASE_URL.to_string()),
            max_connections: 1,
            min_connections: 1,
        },
        collaborators: CollaboratorConfig {
            notification_service_url: String::new(),
            renderer_service_url: String::new(),
            timeout_secs: 2,
        },
        lifecycle: LifecycleConfig {
            share_link_days: 30,
            public_base_url: "https://crm.example.com".to_string(),
        },
    }
}

/// Lifecycle wired to a ledger store, with a fresh company per app.
pub struct TestApp {
    pub store: Arc<dyn LedgerStore>,
    memory: Option<Arc<MemoryLedgerStore>>,
    pub notifications: Arc<RecordingNotificationDispatcher>,
    pub lifecycle: QuoteToCash,
    pub state: AppState,
    pub company_id: Uuid,
    pub user_id: Uuid,
}

impl TestApp {
    pub fn spawn() -> Self {
        let notifications = Arc::new(RecordingNotificationDispatcher::default());
        Self::with_dispatcher(notifications.clone(), notifications)
    }

    /// App whose notification service rejects everything.
    pub fn with_failing_notifications() -> Self {
        Self::with_dispatcher(
            Arc::new(FailingNotificationDispatcher),
            Arc::new(RecordingNotificationDispatcher::default()),
        )
    }

    /// App backed by PostgreSQL at `TEST_DATABASE_URL`, migrations applied.
    /// `None` when the variable is unset, so callers can skip.
    pub async fn postgres() -> Option<Self> {
        init_tracing();
        let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
            tracing::warn!("TEST_DATABASE_URL not set - skipping PostgreSQL test");
            return None;
        };
        let db = Database::new(&database_url, 4, 1)
            .await
            .expect("Failed to connect to TEST_DATABASE_URL");
        db.run_migrations().await.expect("Failed to run migrations");

        let notifications = Arc::new(RecordingNotificationDispatcher::default());
        Some(Self::with_store(
            Arc::new(db),
            None,
            notifications.clone(),
            notifications,
        ))
    }

    fn with_dispatcher(
        dispatcher: Arc<dyn NotificationDispatcher>,
        notifications: Arc<RecordingNotificationDispatcher>,
    ) -> Self {
        init_tracing();
        let memory = Arc::new(MemoryLedgerStore::new());
        Self::with_store(memory.clone(), Some(memory), dispatcher, notifications)
    }

    fn with_store(
        store: Arc<dyn LedgerStore>,
        memory: Option<Arc<MemoryLedgerStore>>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        notifications: Arc<RecordingNotificationDispatcher>,
    ) -> Self {
        let state = AppState::new(
            test_config(),
            store.clone(),
            dispatcher,
            Arc::new(DisabledRenderer),
        );

        TestApp {
            store,
            memory,
            notifications,
            lifecycle: state.lifecycle.clone(),
            state,
            company_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    /// The in-memory store, for failure injection.
    pub fn memory(&self) -> &MemoryLedgerStore {
        self.memory
            .as_deref()
            .expect("Failure injection needs the in-memory store")
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// $1,000 of work at 8% tax: $1,080 total.
    pub async fn create_quote(&self, lead_id: Uuid) -> Quote {
        self.create_quote_with(lead_id, Decimal::new(1000, 0), Decimal::ZERO, Decimal::new(8, 2))
            .await
    }

    pub async fn create_quote_with(
        &self,
        lead_id: Uuid,
        unit_price: Decimal,
        discount: Decimal,
        tax_rate: Decimal,
    ) -> Quote {
        self.lifecycle
            .quotes
            .create(
                self.company_id,
                self.user_id,
                CreateQuote {
                    lead_id,
                    title: "Roof replacement".to_string(),
                    customer_name: "Dana Whitfield".to_string(),
                    customer_email: Some("dana@example.com".to_string()),
                    discount,
                    tax_rate,
                    line_items: vec![LineItemInput {
                        description: "Architectural shingles, 20 squares".to_string(),
                        quantity: Decimal::ONE,
                        unit_price,
                    }],
                },
            )
            .await
            .expect("Failed to create quote")
            .quote
    }

    /// Email the quote and return its share token.
    pub async fn send_quote(&self, quote_id: Uuid) -> String {
        self.lifecycle
            .delivery
            .send_quote(self.company_id, quote_id)
            .await
            .expect("Failed to send quote");
        self.lifecycle
            .quotes
            .get(self.company_id, quote_id)
            .await
            .expect("Failed to reload quote")
            .quote
            .share_token
            .expect("Sent quote has no share token")
    }

    /// Quote signed by both parties, customer first.
    pub async fn signed_quote(&self, lead_id: Uuid) -> Quote {
        let quote = self.create_quote(lead_id).await;
        self.sign_both(&quote).await
    }

    /// Send `quote`, then sign it as the customer and the company.
    pub async fn sign_both(&self, quote: &Quote) -> Quote {
        let token = self.send_quote(quote.quote_id).await;
        self.lifecycle
            .signing
            .sign_customer(&token, signature("Dana Whitfield"))
            .await
            .expect("Customer signature failed");
        self.lifecycle
            .signing
            .sign_company(
                self.company_id,
                quote.quote_id,
                signature("Sam Ortiz"),
                self.user_id,
            )
            .await
            .expect("Company signature failed")
            .quote
    }

    /// Change order for `amount` (no tax) signed by both parties.
    pub async fn approved_change_order(&self, quote: &Quote, title: &str, amount: Decimal) -> ChangeOrder {
        let change_order_id = self
            .lifecycle
            .change_orders
            .propose(
                self.company_id,
                self.user_id,
                ProposeChangeOrder {
                    lead_id: quote.lead_id,
                    quote_id: quote.quote_id,
                    title: title.to_string(),
                    description: None,
                    amount: Some(amount),
                    tax_rate: None,
                    line_items: Vec::new(),
                },
            )
            .await
            .expect("Failed to propose change order")
            .change_order
            .change_order_id;
        self.lifecycle
            .change_orders
            .sign_company(
                self.company_id,
                change_order_id,
                signature("Sam Ortiz"),
                self.user_id,
            )
            .await
            .expect("Company signature failed");
        self.lifecycle
            .delivery
            .send_change_order(self.company_id, change_order_id)
            .await
            .expect("Failed to send change order");
        let token = self
            .lifecycle
            .change_orders
            .get(self.company_id, change_order_id)
            .await
            .expect("Failed to reload change order")
            .change_order
            .share_token
            .expect("Sent change order has no share token");
        self.lifecycle
            .change_orders
            .sign_customer(&token, signature("Dana Whitfield"))
            .await
            .expect("Customer signature failed")
            .change_order
    }

    /// The revision currently in force for `quote_id`.
    pub async fn active_contract(&self, quote_id: Uuid) -> Contract {
        self.lifecycle
            .contracts
            .list_for_quote(self.company_id, quote_id)
            .await
            .expect("Failed to list contracts")
            .into_iter()
            .find(|c| c.status == ContractStatus::Active)
            .expect("Quote has no active contract")
    }

    /// Invoice the active contract plus `change_order_ids`.
    pub async fn invoice(&self, quote_id: Uuid, change_order_ids: Vec<Uuid>) -> InvoiceDetail {
        let contract = self.active_contract(quote_id).await;
        self.lifecycle
            .invoices
            .create(
                self.company_id,
                self.user_id,
                CreateInvoice {
                    contract_id: contract.contract_id,
                    change_order_ids,
                    additional_items: Vec::new(),
                    invoice_date: None,
                    due_date: None,
                    tax_rate: None,
                },
            )
            .await
            .expect("Failed to create invoice")
    }
}

pub fn signature(name: &str) -> SignaturePayload {
    SignaturePayload {
        signer_name: name.to_string(),
        signer_title: None,
        signature_image: SIGNATURE_IMAGE.to_string(),
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: Some("integration-test".to_string()),
    }
}
