//! Integration tests for invoice assembly from contracts and change orders.

mod common;

use chrono::NaiveDate;
use common::TestApp;
use quote_to_cash_service::models::{InvoiceStatus, LineItemInput, LineItemSource};
use quote_to_cash_service::services::{CreateInvoice, LifecycleError, ProposeChangeOrder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn request(contract_id: Uuid) -> CreateInvoice {
    CreateInvoice {
        contract_id,
        change_order_ids: Vec::new(),
        additional_items: Vec::new(),
        invoice_date: None,
        due_date: None,
        tax_rate: None,
    }
}

#[tokio::test]
async fn line_items_sum_to_contract_plus_change_orders() {
    let app = TestApp::spawn();
    let quote = app
        .create_quote_with(Uuid::new_v4(), dec!(1000), dec!(100), dec!(0.08))
        .await;
    assert_eq!(quote.total, dec!(972.00));
    let quote = app.sign_both(&quote).await;
    let change_order = app
        .approved_change_order(&quote, "Replace rotten decking", dec!(200))
        .await;

    let detail = app
        .invoice(quote.quote_id, vec![change_order.change_order_id])
        .await;

    let line_total: Decimal = detail.line_items.iter().map(|l| l.total).sum();
    assert_eq!(line_total, detail.invoice.total);
    assert_eq!(detail.invoice.total, dec!(1172.00));
    assert_eq!(detail.invoice.status, InvoiceStatus::Draft);
    assert_eq!(detail.invoice.balance_due, dec!(1172.00));

    let contract_group: Decimal = detail
        .line_items
        .iter()
        .filter(|l| l.source_type == LineItemSource::Contract)
        .map(|l| l.total)
        .sum();
    assert_eq!(contract_group, dec!(972.00));
    assert!(detail
        .line_items
        .iter()
        .any(|l| l.description == "Discount" && l.total == dec!(-100)));

    let change_order_lines: Vec<_> = detail
        .line_items
        .iter()
        .filter(|l| l.source_type == LineItemSource::ChangeOrder)
        .collect();
    assert_eq!(change_order_lines.len(), 1);
    assert_eq!(change_order_lines[0].source_id, Some(change_order.change_order_id));
    assert_eq!(change_order_lines[0].total, dec!(200.00));
    assert!(change_order_lines[0].description.starts_with("CO-0001: "));
}

#[tokio::test]
async fn unapproved_change_orders_are_not_billed() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let pending = app
        .lifecycle
        .change_orders
        .propose(
            app.company_id,
            app.user_id,
            ProposeChangeOrder {
                lead_id: quote.lead_id,
                quote_id: quote.quote_id,
                title: "Skylight".to_string(),
                description: None,
                amount: Some(dec!(450)),
                tax_rate: None,
                line_items: Vec::new(),
            },
        )
        .await
        .unwrap()
        .change_order;

    let detail = app
        .invoice(quote.quote_id, vec![pending.change_order_id, Uuid::new_v4()])
        .await;
    assert_eq!(detail.invoice.total, dec!(1080.00));
    assert!(detail
        .line_items
        .iter()
        .all(|l| l.source_type == LineItemSource::Contract));
}

#[tokio::test]
async fn additional_items_are_taxed_at_invoice_rate() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;

    let detail = app
        .lifecycle
        .invoices
        .create(
            app.company_id,
            app.user_id,
            CreateInvoice {
                additional_items: vec![LineItemInput {
                    description: "Permit fee".to_string(),
                    quantity: dec!(1),
                    unit_price: dec!(100),
                }],
                tax_rate: Some(dec!(0.10)),
                ..request(contract.contract_id)
            },
        )
        .await
        .unwrap();

    let additional = detail
        .line_items
        .iter()
        .find(|l| l.source_type == LineItemSource::Additional)
        .unwrap();
    assert_eq!(additional.subtotal, dec!(100.00));
    assert_eq!(additional.tax_amount, dec!(10.00));
    assert_eq!(additional.total, dec!(110.00));
    assert_eq!(detail.invoice.total, dec!(1190.00));
}

#[tokio::test]
async fn invoice_numbers_follow_company_sequence() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;

    let first = app.invoice(quote.quote_id, Vec::new()).await;
    let second = app.invoice(quote.quote_id, Vec::new()).await;
    assert_eq!(first.invoice.invoice_number, "INV-00001");
    assert_eq!(second.invoice.invoice_number, "INV-00002");
}

#[tokio::test]
async fn voided_contract_cannot_be_invoiced() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;

    let voided = app
        .lifecycle
        .contracts
        .void(app.company_id, contract.contract_id, "Customer cancelled job", app.user_id)
        .await
        .unwrap();
    assert_eq!(voided.void_reason.as_deref(), Some("Customer cancelled job"));

    let err = app
        .lifecycle
        .invoices
        .create(app.company_id, app.user_id, request(contract.contract_id))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));

    let err = app
        .lifecycle
        .contracts
        .void(app.company_id, contract.contract_id, "again", app.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));
}

#[tokio::test]
async fn failed_line_item_write_removes_the_invoice() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;

    app.memory().fail_next_line_item_insert();
    let result = app
        .lifecycle
        .invoices
        .create(app.company_id, app.user_id, request(contract.contract_id))
        .await;
    assert!(result.is_err());
    assert_eq!(app.memory().invoice_count().await, 0);

    // The next attempt goes through.
    app.invoice(quote.quote_id, Vec::new()).await;
    assert_eq!(app.memory().invoice_count().await, 1);
}

#[tokio::test]
async fn due_date_cannot_precede_invoice_date() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;

    let err = app
        .lifecycle
        .invoices
        .create(
            app.company_id,
            app.user_id,
            CreateInvoice {
                invoice_date: NaiveDate::from_ymd_opt(2026, 3, 10),
                due_date: NaiveDate::from_ymd_opt(2026, 3, 1),
                ..request(contract.contract_id)
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));
}

#[tokio::test]
async fn oversized_additional_item_is_a_validation_error() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let contract = app.active_contract(quote.quote_id).await;

    let err = app
        .lifecycle
        .invoices
        .create(
            app.company_id,
            app.user_id,
            CreateInvoice {
                additional_items: vec![LineItemInput {
                    description: "Dumpster rental".to_string(),
                    quantity: Decimal::MAX,
                    unit_price: dec!(2),
                }],
                tax_rate: Some(dec!(0.10)),
                ..request(contract.contract_id)
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ValidationError(_)));
    assert_eq!(app.memory().invoice_count().await, 0);
}

#[tokio::test]
async fn unpaid_invoice_can_be_cancelled_once() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let detail = app.invoice(quote.quote_id, Vec::new()).await;

    let cancelled = app
        .lifecycle
        .invoices
        .cancel(app.company_id, detail.invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);

    let err = app
        .lifecycle
        .invoices
        .cancel(app.company_id, detail.invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState(_)));
}

#[tokio::test]
async fn sending_invoice_installs_share_link() {
    let app = TestApp::spawn();
    let quote = app.signed_quote(Uuid::new_v4()).await;
    let detail = app.invoice(quote.quote_id, Vec::new()).await;

    let receipt = app
        .lifecycle
        .delivery
        .send_invoice(app.company_id, detail.invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(receipt.recipient, "dana@example.com");
    assert!(receipt
        .share_url
        .starts_with("https://crm.example.com/invoices/view/"));
    assert!(!receipt.pdf_attached);

    let sent = app
        .lifecycle
        .invoices
        .get(app.company_id, detail.invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(sent.invoice.status, InvoiceStatus::Sent);
    assert!(app
        .notifications
        .subjects()
        .contains(&format!("Invoice {}", sent.invoice.invoice_number)));
}
