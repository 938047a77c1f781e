//! Integration tests for change order proposal, dual signing and contract revisions.

mod common;

use chrono::Utc;
use common::{signature, TestApp, SIGNATURE_IMAGE};
use quote_to_cash_service::models::{
    ChangeOrderStatus, ContractStatus, LineItemInput, NewContract, Quote, SignatureSnapshot,
    SignerRole,
};
use quote_to_cash_service::services::{
    LedgerStore, LifecycleError, ProposeChangeOrder, StoreError,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn proposal(quote: &Quote, title: &str, amount: Decimal) -> ProposeChangeOrder {
    ProposeChangeOrder {
        lead_id: quote.lead_id,
        quote_id: quote.quote_id,
        title: title.to_string(),
        description: None,
        amount: Some(amount),
        tax_rate: None,
        line_items: Vec::new(),
    }
}

async fn propose(app: &TestApp, request: ProposeChangeOrder) -> Uuid {
    app.lifecycle
        .change_orders
        .propose(app.company_id, app.user_id, request)
        .await
        .unwrap()
        .change_order
        .change_order_id
}

/// Email the change order and return its share token.
async fn send(app: &TestApp, change_order_id: Uuid) -> String {
    app.lifecycle
        .delivery
        .send_change_order(app.company_id, change_order_id)
        .await
        .unwrap();
    app.lifecycle
        .change_orders
        .get(app.company_id, change_order_id)
        .await
        .unwrap()
        .change_order
        .share_token
        .unwrap()
}

async fn live_total(app: &TestApp, quote_id: Uuid) -> Decimal {
    app.lifecycle
        .quotes
        .get(app.company_id, quote_id)
        .await
        .unwrap()
        .quote
        .total
}

#[tokio::test]
async fn approved_change_order_revises_quote_and_contract() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Replace rotten decking", dec!(200))).await;
    let token = send(&app, change_order_id).await;

    let customer = app
        .lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    assert_eq!(
        customer.change_order.status,
        ChangeOrderStatus::PendingCompanySignature
    );
    assert!(customer.contract_revision.is_none());
    assert_eq!(live_total(&app, quote.quote_id).await, dec!(1080.00));

    let company = app
        .lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert_eq!(company.change_order.status, ChangeOrderStatus::Approved);
    assert!(company.change_order.approved_utc.is_some());
    assert_eq!(company.quote.unwrap().total, dec!(1280.00));

    let revision = company.contract_revision.unwrap();
    assert_eq!(revision.revision, 2);
    assert_eq!(revision.change_order_id, Some(change_order_id));
    assert_eq!(revision.original_total, dec!(1080.00));
    assert_eq!(revision.current_total, dec!(1280.00));

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
async fn company_may_sign_change_order_first() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Skylight", dec!(450))).await;

    let company = app
        .lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert_eq!(
        company.change_order.status,
        ChangeOrderStatus::PendingCustomerSignature
    );

    let token = send(&app, change_order_id).await;
    let customer = app
        .lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    assert_eq!(customer.change_order.status, ChangeOrderStatus::Approved);
    assert_eq!(customer.contract_revision.unwrap().current_total, dec!(1530.00));
}

#[tokio::test]
async fn only_approved_change_orders_move_the_live_total() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let pending = propose(&app, proposal(&quote, "Chimney flashing", dec!(500))).await;
    let rejected = propose(&app, proposal(&quote, "Solar prep", dec!(900))).await;
    app.lifecycle
        .change_orders
        .reject(app.company_id, rejected, Some("Customer declined".to_string()))
        .await
        .unwrap();
    assert_eq!(live_total(&app, quote.quote_id).await, dec!(1080.00));

    let credit = propose(&app, proposal(&quote, "Reuse existing drip edge", dec!(-150))).await;
    let token = send(&app, credit).await;
    app.lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    app.lifecycle
        .change_orders
        .sign_company(app.company_id, credit, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert_eq!(live_total(&app, quote.quote_id).await, dec!(930.00));

    let still_pending = app
        .lifecycle
        .change_orders
        .get(app.company_id, pending)
        .await
        .unwrap();
    assert_eq!(still_pending.change_order.status, ChangeOrderStatus::Pending);
}

#[tokio::test]
async fn rejection_is_terminal() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Ice shield", dec!(120))).await;

    let rejected = app
        .lifecycle
        .change_orders
        .reject(app.company_id, change_order_id, Some("  Over budget ".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, ChangeOrderStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Over budget"));

    let err = app
        .lifecycle
        .change_orders
        .reject(app.company_id, change_order_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));

    let err = app
        .lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));
}

#[tokio::test]
async fn line_items_price_the_change_order() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let first = propose(&app, proposal(&quote, "Vent", dec!(80))).await;
    let detail = app
        .lifecycle
        .change_orders
        .propose(
            app.company_id,
            app.user_id,
            ProposeChangeOrder {
                tax_rate: Some(dec!(0.05)),
                amount: None,
                line_items: vec![
                    LineItemInput {
                        description: "Plywood sheet".to_string(),
                        quantity: dec!(2),
                        unit_price: dec!(150),
                    },
                    LineItemInput {
                        description: "Labor".to_string(),
                        quantity: dec!(1),
                        unit_price: dec!(45.50),
                    },
                ],
                ..proposal(&quote, "Decking", dec!(0))
            },
        )
        .await
        .unwrap();

    let first = app.lifecycle.change_orders.get(app.company_id, first).await.unwrap();
    assert_eq!(first.display_number, "CO-0001");
    assert_eq!(detail.display_number, "CO-0002");
    assert_eq!(detail.change_order.amount, dec!(345.50));
    assert_eq!(detail.change_order.tax, dec!(17.28));
    assert_eq!(detail.change_order.total, dec!(362.78));
    assert_eq!(detail.line_items.len(), 2);
}

#[tokio::test]
async fn approval_before_contract_updates_quote_only() {
    let app = TestApp::spawn();
    let quote = app.create_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Upgrade underlayment", dec!(200))).await;

    app.lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    let token = send(&app, change_order_id).await;
    let outcome = app
        .lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();

    assert_eq!(outcome.change_order.status, ChangeOrderStatus::Approved);
    assert!(outcome.contract_revision.is_none());
    assert_eq!(outcome.quote.unwrap().total, dec!(1280.00));
}

#[tokio::test]
async fn duplicate_change_order_signature_is_rejected() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Gutter guards", dec!(300))).await;
    let token = send(&app, change_order_id).await;

    app.lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    let err = app
        .lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateSubmission(SignerRole::Customer)
    ));
}

#[tokio::test]
async fn change_order_must_match_quote_lead() {
    let app = TestApp::spawn();
    let quote = app.create_quote(Uuid::new_v4()).await;

    let err = app
        .lifecycle
        .change_orders
        .propose(
            app.company_id,
            app.user_id,
            ProposeChangeOrder {
                lead_id: Uuid::new_v4(),
                ..proposal(&quote, "Extra", dec!(10))
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));
}

#[tokio::test]
async fn oversized_change_order_amount_is_a_validation_error() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let err = app
        .lifecycle
        .change_orders
        .propose(
            app.company_id,
            app.user_id,
            proposal(&quote, "Everything", Decimal::MAX),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));

    let err = app
        .lifecycle
        .change_orders
        .propose(
            app.company_id,
            app.user_id,
            ProposeChangeOrder {
                amount: None,
                line_items: vec![LineItemInput {
                    description: "Shingles".to_string(),
                    quantity: Decimal::MAX,
                    unit_price: dec!(2),
                }],
                ..proposal(&quote, "Everything", dec!(0))
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));
}

fn snapshot(name: &str) -> SignatureSnapshot {
    SignatureSnapshot {
        signer_name: name.to_string(),
        signature_image: SIGNATURE_IMAGE.to_string(),
        signed_utc: Utc::now(),
    }
}

#[tokio::test]
async fn revision_built_on_a_superseded_contract_is_refused() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let initial = app.active_contract(quote.quote_id).await;
    app.approved_change_order(&quote, "Replace rotten decking", dec!(200))
        .await;
    let revision = app.active_contract(quote.quote_id).await;
    assert_eq!(revision.current_total, dec!(1280.00));

    // Built from revision 1 after revision 2 already replaced it.
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

    let active = app.active_contract(quote.quote_id).await;
    assert_eq!(active.contract_id, revision.contract_id);
    assert_eq!(active.current_total, dec!(1280.00));
}

#[tokio::test]
async fn approval_after_void_does_not_reactivate_the_contract() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;
    app.lifecycle
        .contracts
        .void(app.company_id, contract.contract_id, "Customer cancelled job", app.user_id)
        .await
        .unwrap();

    let change_order_id = propose(&app, proposal(&quote, "Tear-off", dec!(200))).await;
    app.lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    let token = send(&app, change_order_id).await;
    let outcome = app
        .lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    assert!(outcome.contract_revision.is_none());

    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].status, ContractStatus::Voided);
}

#[tokio::test]
async fn failed_approval_is_repaired_on_retry() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let change_order_id = propose(&app, proposal(&quote, "Ridge vent", dec!(200))).await;
    let token = send(&app, change_order_id).await;
    app.lifecycle
        .change_orders
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();

    // The approval commits, then the quote totals write fails.
    app.memory().fail_next_totals_update();
    let err = app
        .lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Store(StoreError::Database(_))));
    let approved = app
        .lifecycle
        .change_orders
        .get(app.company_id, change_order_id)
        .await
        .unwrap();
    assert_eq!(approved.change_order.status, ChangeOrderStatus::Approved);
    assert_eq!(live_total(&app, quote.quote_id).await, dec!(1080.00));
    assert_eq!(app.active_contract(quote.quote_id).await.revision, 1);

    // Retrying still reports the duplicate, but the approval now takes effect.
    let err = app
        .lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DuplicateSubmission(SignerRole::CompanyRep)
    ));
    assert_eq!(live_total(&app, quote.quote_id).await, dec!(1280.00));
    let active = app.active_contract(quote.quote_id).await;
    assert_eq!(active.revision, 2);
    assert_eq!(active.change_order_id, Some(change_order_id));
    assert_eq!(active.current_total, dec!(1280.00));

    // A further retry changes nothing.
    app.lifecycle
        .change_orders
        .sign_company(app.company_id, change_order_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap_err();
    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 2);
}
