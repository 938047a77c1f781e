//! Compensating actions for multi-step writes that cannot share a transaction.
//!
//! Each forward step that succeeds registers the action undoing it. On failure
//! the registered actions run newest first; on success they are discarded.

use futures::future::BoxFuture;
use tracing::{error, info};

use super::error::StoreError;
use super::metrics::DOWNSTREAM_FAILURES_TOTAL;

type Compensation<'a> = BoxFuture<'a, Result<(), StoreError>>;

pub struct Saga<'a> {
    name: &'static str,
    compensations: Vec<(&'static str, Compensation<'a>)>,
}

impl<'a> Saga<'a> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            compensations: Vec::new(),
        }
    }

    /// Register the undo of a step that just succeeded. The future is not
    /// polled unless the saga is compensated.
    pub fn on_failure(&mut self, step: &'static str, compensation: Compensation<'a>) {
        self.compensations.push((step, compensation));
    }

    pub fn complete(self) {}

    /// Run every registered compensation, newest first. A failing
    /// compensation is logged and the rest still run.
    pub async fn compensate(self) {
        let saga = self.name;
        for (step, compensation) in self.compensations.into_iter().rev() {
            match compensation.await {
                Ok(()) => info!(saga, step, "Compensation applied"),
                Err(e) => {
                    DOWNSTREAM_FAILURES_TOTAL
                        .with_label_values(&["compensation"])
                        .inc();
                    error!(saga, step, error = %e, "Compensation failed");
                }
            }
        }
    }
}
