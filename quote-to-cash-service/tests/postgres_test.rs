//! Lifecycle suites run against PostgreSQL at `TEST_DATABASE_URL`.
//!
//! Each test gets a fresh company id, so runs share one database without
//! seeing each other's rows. Without the variable every test returns early.

mod common;

use chrono::Utc;
use common::{signature, TestApp, SIGNATURE_IMAGE};
use quote_to_cash_service::models::{
    ContractStatus, InvoiceStatus, NewContract, PaymentMethod, SignatureSnapshot, SignerRole,
    SigningState,
};
use quote_to_cash_service::services::{LedgerStore, LifecycleError, RecordPayment, StoreError};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn snapshot(name: &str) -> SignatureSnapshot {
    SignatureSnapshot {
        signer_name: name.to_string(),
        signature_image: SIGNATURE_IMAGE.to_string(),
        signed_utc: Utc::now(),
    }
}

#[tokio::test]
async fn signing_creates_one_contract() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let quote = app.create_quote(Uuid::new_v4()).await;
    assert_eq!(quote.total, dec!(1080.00));
    let token = app.send_quote(quote.quote_id).await;

    let customer = app
        .lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    assert_eq!(customer.quote.signing_state, SigningState::CustomerSigned);
    assert!(customer.contract.is_none());

    let company = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert!(company.contract_created);
    assert!(company.quote.is_locked);
    let contract = company.contract.unwrap();
    assert_eq!(contract.revision, 1);
    assert_eq!(contract.current_total, dec!(1080.00));

    let err = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateSubmission(SignerRole::CompanyRep)
    ));
    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
}

#[tokio::test]
async fn duplicate_customer_signature_is_refused() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let quote = app.create_quote(Uuid::new_v4()).await;
    let token = app.send_quote(quote.quote_id).await;
    app.lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();

    let err = app
        .lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateSubmission(SignerRole::Customer)
    ));
    let detail = app
        .lifecycle
        .quotes
        .get(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(detail.signatures.len(), 1);
}

#[tokio::test]
async fn change_order_revision_supersedes_only_the_active_contract() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let initial = app.active_contract(quote.quote_id).await;
    app.approved_change_order(&quote, "Replace rotten decking", dec!(200))
        .await;

    let revision = app.active_contract(quote.quote_id).await;
    assert_eq!(revision.revision, 2);
    assert_eq!(revision.current_total, dec!(1280.00));
    assert_eq!(revision.original_total, dec!(1080.00));
    let live = app
        .lifecycle
        .quotes
        .get(app.company_id, quote.quote_id)
        .await
        .unwrap()
        .quote;
    assert_eq!(live.total, dec!(1280.00));

    let stale = NewContract {
        company_id: app.company_id,
        quote_id: quote.quote_id,
        lead_id: quote.lead_id,
        change_order_id: Some(Uuid::new_v4()),
        supersedes: Some(initial.contract_id),
        original: initial.original_totals(),
        current: initial.original_totals(),
        customer: snapshot("Dana Whitfield"),
        company: snapshot("Sam Ortiz"),
        line_items: Vec::new(),
    };
    let err = app.store.insert_contract(&stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    let statuses: Vec<ContractStatus> = contracts.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![ContractStatus::Superseded, ContractStatus::Active]
    );
}

#[tokio::test]
async fn invoice_totals_and_payments_settle() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order = app
        .approved_change_order(&quote, "Replace rotten decking", dec!(200))
        .await;

    let detail = app
        .invoice(quote.quote_id, vec![change_order.change_order_id])
        .await;
    let line_total: Decimal = detail.line_items.iter().map(|l| l.total).sum();
    assert_eq!(line_total, dec!(1280.00));
    assert_eq!(detail.invoice.total, dec!(1280.00));
    assert_eq!(detail.invoice.balance_due, dec!(1280.00));

    let recorded = app
        .lifecycle
        .payments
        .record(
            app.company_id,
            detail.invoice.invoice_id,
            app.user_id,
            RecordPayment {
                amount: dec!(1280.00),
                method: PaymentMethod::Check,
                payment_date: None,
                reference: Some("4411".to_string()),
                notes: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(recorded.invoice.status, InvoiceStatus::Paid);
    assert_eq!(recorded.invoice.balance_due, dec!(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_final_signatures_create_one_contract() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let quote = app.create_quote(Uuid::new_v4()).await;
    let token = app.send_quote(quote.quote_id).await;

    let customer = {
        let lifecycle = app.lifecycle.clone();
        tokio::spawn(async move {
            lifecycle
                .signing
                .sign_customer(&token, signature("Dana Whitfield"))
                .await
        })
    };
    let company = {
        let lifecycle = app.lifecycle.clone();
        let (company_id, quote_id, user_id) = (app.company_id, quote.quote_id, app.user_id);
        tokio::spawn(async move {
            lifecycle
                .signing
                .sign_company(company_id, quote_id, signature("Sam Ortiz"), user_id)
                .await
        })
    };
    let (customer, company) = tokio::join!(customer, company);
    let outcomes = [customer.unwrap().unwrap(), company.unwrap().unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.contract_created).count(), 1);

    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].status, ContractStatus::Active);
}
