pub mod change_orders;
pub mod commissions;
pub mod contracts;
pub mod health;
pub mod invoices;
pub mod payments;
pub mod quotes;
