pub mod change_orders;
pub mod commissions;
pub mod contracts;
pub mod database;
pub mod delivery;
pub mod error;
pub mod hooks;
pub mod invoices;
pub mod memory;
pub mod metrics;
pub mod notification;
pub mod payments;
pub mod quote_signing;
pub mod quotes;
pub mod renderer;
pub mod saga;
pub mod signature_capture;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

pub use change_orders::{ChangeOrderWorkflow, ProposeChangeOrder};
pub use commissions::{AssignCommission, CommissionEngine};
pub use contracts::{ContractCreation, ContractSnapshotGenerator};
pub use database::Database;
pub use delivery::DocumentDelivery;
pub use error::{LifecycleError, StoreError};
pub use hooks::LifecycleHooks;
pub use invoices::{CreateInvoice, InvoiceAggregator};
pub use memory::MemoryLedgerStore;
pub use notification::{NotificationDispatcher, Notifier};
pub use payments::{PaymentLedger, RecordPayment};
pub use quote_signing::{QuoteSigningStateMachine, SigningOutcome};
pub use quotes::{CreateQuote, QuoteAuthoring};
pub use renderer::DocumentRenderer;
pub use store::LedgerStore;

/// Knobs shared by the lifecycle components.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub share_link_days: i64,
    pub public_base_url: String,
    /// Upper bound on every notification and rendering call.
    pub downstream_timeout: Duration,
}

/// All lifecycle components wired to one store and one set of collaborators.
#[derive(Clone)]
pub struct QuoteToCash {
    pub store: Arc<dyn LedgerStore>,
    pub quotes: QuoteAuthoring,
    pub signing: QuoteSigningStateMachine,
    pub contracts: ContractSnapshotGenerator,
    pub change_orders: ChangeOrderWorkflow,
    pub invoices: InvoiceAggregator,
    pub payments: PaymentLedger,
    pub commissions: CommissionEngine,
    pub delivery: DocumentDelivery,
}

impl QuoteToCash {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        renderer: Arc<dyn DocumentRenderer>,
        settings: &LifecycleSettings,
    ) -> Self {
        let notifier = Notifier::new(dispatcher, settings.downstream_timeout);
        let commissions = CommissionEngine::new(store.clone());
        let hooks = LifecycleHooks::new(commissions.clone());
        let contracts = ContractSnapshotGenerator::new(store.clone());

        Self {
            quotes: QuoteAuthoring::new(store.clone()),
            signing: QuoteSigningStateMachine::new(
                store.clone(),
                contracts.clone(),
                hooks.clone(),
                notifier.clone(),
            ),
            change_orders: ChangeOrderWorkflow::new(
                store.clone(),
                contracts.clone(),
                hooks.clone(),
                notifier.clone(),
            ),
            invoices: InvoiceAggregator::new(store.clone(), hooks.clone()),
            payments: PaymentLedger::new(store.clone(), hooks),
            delivery: DocumentDelivery::new(
                store.clone(),
                renderer,
                notifier,
                settings.downstream_timeout,
                settings.share_link_days,
                &settings.public_base_url,
            ),
            contracts,
            commissions,
            store,
        }
    }
}
