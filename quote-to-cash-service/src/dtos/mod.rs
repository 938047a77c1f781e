pub mod change_orders;
pub mod commissions;
pub mod contracts;
pub mod invoices;
pub mod quotes;

pub use change_orders::{ProposeChangeOrderRequest, RejectChangeOrderRequest};
pub use commissions::AssignCommissionRequest;
pub use contracts::VoidContractRequest;
pub use invoices::{CreateInvoiceRequest, RecordPaymentRequest};
pub use quotes::{
    CreateQuoteRequest, LineItemRequest, PublicSignRequest, ReplaceLineItemsRequest,
    SignatureRequest, SigningResponse,
};
