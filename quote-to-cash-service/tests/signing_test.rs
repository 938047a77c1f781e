//! Integration tests for dual-signature quote signing and contract creation.

mod common;

use chrono::{Duration, Utc};
use common::{signature, TestApp};
use quote_to_cash_service::models::{
    ContractStatus, DocumentKind, LineItemInput, QuoteStatus, SignerRole, SigningState,
};
use quote_to_cash_service::services::store::ShareLink;
use quote_to_cash_service::services::{ContractCreation, LedgerStore, LifecycleError};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn contract_exists_only_once_both_parties_signed() {
    let app = TestApp::spawn();
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
    assert_eq!(customer.quote.status, QuoteStatus::Accepted);
    assert!(!customer.quote.is_locked);
    assert!(customer.contract.is_none());
    assert!(app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap()
        .is_empty());

    let company = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert_eq!(company.quote.signing_state, SigningState::FullySigned);
    assert!(company.quote.is_locked);
    assert!(company.contract_created);

    let contract = company.contract.unwrap();
    assert_eq!(contract.revision, 1);
    assert_eq!(contract.status, ContractStatus::Active);
    assert_eq!(contract.original_total, dec!(1080.00));
    assert_eq!(contract.current_total, dec!(1080.00));
    assert_eq!(contract.customer_signer_name, "Dana Whitfield");
    assert_eq!(contract.company_signer_name, "Sam Ortiz");

    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
}

#[tokio::test]
async fn company_may_sign_before_customer() {
    let app = TestApp::spawn();
    let quote = app.create_quote(Uuid::new_v4()).await;

    let company = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert_eq!(company.quote.signing_state, SigningState::CompanySigned);
    assert!(company.contract.is_none());

    let token = app.send_quote(quote.quote_id).await;
    let customer = app
        .lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    assert_eq!(customer.quote.signing_state, SigningState::FullySigned);
    assert!(customer.contract_created);
    assert_eq!(customer.contract.unwrap().original_total, dec!(1080.00));
}

#[tokio::test]
async fn second_customer_signature_is_a_duplicate() {
    let app = TestApp::spawn();
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

    let signatures = app
        .store
        .list_signatures(DocumentKind::Quote, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].ip_address.as_deref(), Some("203.0.113.7"));
}

#[tokio::test]
async fn creating_the_initial_contract_again_is_a_no_op() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let again = app.lifecycle.contracts.create_initial(&quote).await.unwrap();
    assert!(matches!(again, ContractCreation::Existing(_)));
    assert_eq!(again.contract().revision, 1);

    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 1);
}

#[tokio::test]
async fn expired_share_link_is_rejected() {
    let app = TestApp::spawn();
    let quote = app.create_quote(Uuid::new_v4()).await;
    app.store
        .mark_quote_sent(
            app.company_id,
            quote.quote_id,
            &ShareLink {
                token: "expired-token".to_string(),
                expires_at: Utc::now() - Duration::days(1),
            },
        )
        .await
        .unwrap();

    let err = app
        .lifecycle
        .signing
        .sign_customer("expired-token", signature("Dana Whitfield"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::LinkExpired));
}

#[tokio::test]
async fn unknown_share_token_is_not_found() {
    let app = TestApp::spawn();
    let err = app
        .lifecycle
        .signing
        .sign_customer("no-such-token", signature("Dana Whitfield"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn malformed_signature_image_is_a_validation_error() {
    let app = TestApp::spawn();
    let quote = app.create_quote(Uuid::new_v4()).await;
    let token = app.send_quote(quote.quote_id).await;

    let mut payload = signature("Dana Whitfield");
    payload.signature_image = "not-an-image".to_string();
    let err = app
        .lifecycle
        .signing
        .sign_customer(&token, payload)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));

    let reloaded = app.lifecycle.quotes.get(app.company_id, quote.quote_id).await.unwrap();
    assert_eq!(reloaded.quote.signing_state, SigningState::Unsigned);
    assert!(reloaded.signatures.is_empty());
}

#[tokio::test]
async fn fully_signed_quote_is_locked_against_edits() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let err = app
        .lifecycle
        .quotes
        .replace_line_items(
            app.company_id,
            quote.quote_id,
            vec![LineItemInput {
                description: "Gutters".to_string(),
                quantity: dec!(1),
                unit_price: dec!(300),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));

    let err = app
        .lifecycle
        .quotes
        .delete(app.company_id, quote.quote_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));
}

#[tokio::test]
async fn executed_contract_is_emailed_to_customer() {
    let app = TestApp::spawn();
    app.signed_quote(Uuid::new_v4()).await;

    let subjects = app.notifications.wait_for(2).await;
    assert_eq!(
        subjects,
        vec![
            "Your quote: Roof replacement".to_string(),
            "Executed contract: Roof replacement".to_string(),
        ]
    );
}

#[tokio::test]
async fn notification_outage_does_not_undo_signing() {
    let app = TestApp::with_failing_notifications();
    let quote = app.create_quote(Uuid::new_v4()).await;

    // Sending surfaces the outage, but the share link is already committed.
    let err = app
        .lifecycle
        .delivery
        .send_quote(app.company_id, quote.quote_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::DownstreamFailure { .. }));
    let sent = app.lifecycle.quotes.get(app.company_id, quote.quote_id).await.unwrap().quote;
    assert_eq!(sent.status, QuoteStatus::Sent);
    let token = sent.share_token.unwrap();

    app.lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    let outcome = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    assert!(outcome.contract_created);
}
