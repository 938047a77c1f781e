//! End-to-end walk through the quote-to-cash lifecycle of one roofing job.

mod common;

use common::{signature, TestApp};
use quote_to_cash_service::models::{
    AssignmentPolicy, CommissionRole, CommissionStatus, ContractStatus, InvoiceStatus, PaidWhen,
    PaymentMethod,
};
use quote_to_cash_service::services::{AssignCommission, RecordPayment};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn half_payment() -> RecordPayment {
    RecordPayment {
        amount: dec!(640),
        method: PaymentMethod::Card,
        payment_date: None,
        reference: None,
        notes: None,
    }
}

#[tokio::test]
async fn quote_to_cash_lifecycle() {
    let app = TestApp::spawn();
    let lead_id = Uuid::new_v4();
    let commission = |role, paid_when| AssignCommission {
        lead_id,
        quote_id: None,
        role,
        assignee_user_id: Uuid::new_v4(),
        paid_when,
        rate: Some(dec!(0.10)),
        flat_amount: None,
        policy: AssignmentPolicy::AllowConcurrentRoleCommissions,
    };

    // Quote for $1,000 at 8% tax.
    let quote = app.create_quote(lead_id).await;
    assert_eq!(quote.total, dec!(1080.00));
    app.lifecycle
        .commissions
        .assign(
            app.company_id,
            commission(CommissionRole::SalesRep, PaidWhen::WhenDepositPaid),
        )
        .await
        .unwrap();
    app.lifecycle
        .commissions
        .assign(
            app.company_id,
            commission(CommissionRole::SalesManager, PaidWhen::WhenFinalPaid),
        )
        .await
        .unwrap();

    // Customer signs from the emailed link, then the company countersigns.
    let token = app.send_quote(quote.quote_id).await;
    app.lifecycle
        .signing
        .sign_customer(&token, signature("Dana Whitfield"))
        .await
        .unwrap();
    let signed = app
        .lifecycle
        .signing
        .sign_company(app.company_id, quote.quote_id, signature("Sam Ortiz"), app.user_id)
        .await
        .unwrap();
    let contract = signed.contract.unwrap();
    assert_eq!(contract.original_total, dec!(1080.00));

    // A $200 change order is approved and revises the contract.
    let quote = signed.quote;
    let change_order = app
        .approved_change_order(&quote, "Replace rotten decking", dec!(200))
        .await;
    let contracts = app
        .lifecycle
        .contracts
        .list_for_quote(app.company_id, quote.quote_id)
        .await
        .unwrap();
    assert_eq!(contracts.len(), 2);
    assert_eq!(contracts[0].status, ContractStatus::Superseded);
    assert_eq!(contracts[1].status, ContractStatus::Active);
    assert_eq!(contracts[1].current_total, dec!(1280.00));
    assert_eq!(contracts[1].original_total, dec!(1080.00));

    // The invoice bills the revised contract.
    let detail = app
        .invoice(quote.quote_id, vec![change_order.change_order_id])
        .await;
    let line_total: Decimal = detail.line_items.iter().map(|l| l.total).sum();
    assert_eq!(line_total, dec!(1280.00));
    assert_eq!(detail.invoice.total, dec!(1280.00));
    let invoice_id = detail.invoice.invoice_id;

    // Deposit clears: the deposit commission becomes eligible.
    let deposit = app
        .lifecycle
        .payments
        .record(app.company_id, invoice_id, app.user_id, half_payment())
        .await
        .unwrap();
    assert_eq!(deposit.invoice.status, InvoiceStatus::Partial);
    app.lifecycle
        .payments
        .mark_cleared(app.company_id, deposit.payment.payment_id)
        .await
        .unwrap();

    // Final payment recorded but not yet cleared.
    let last = app
        .lifecycle
        .payments
        .record(app.company_id, invoice_id, app.user_id, half_payment())
        .await
        .unwrap();
    assert_eq!(last.invoice.status, InvoiceStatus::Paid);
    assert_eq!(last.invoice.amount_cleared, dec!(640));

    let commissions = app
        .lifecycle
        .commissions
        .evaluate_lead(app.company_id, lead_id)
        .await
        .unwrap();
    let status_of = |role: CommissionRole| {
        commissions
            .iter()
            .find(|c| c.role == role)
            .map(|c| (c.status, c.amount))
            .unwrap()
    };
    assert_eq!(
        status_of(CommissionRole::SalesRep),
        (CommissionStatus::Eligible, dec!(128.00))
    );
    assert_eq!(
        status_of(CommissionRole::SalesManager),
        (CommissionStatus::Pending, dec!(128.00))
    );

    // Clearing the final payment settles the job.
    app.lifecycle
        .payments
        .mark_cleared(app.company_id, last.payment.payment_id)
        .await
        .unwrap();
    let manager = app
        .lifecycle
        .commissions
        .list(app.company_id, lead_id)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.role == CommissionRole::SalesManager)
        .unwrap();
    assert_eq!(manager.status, CommissionStatus::Eligible);
}
