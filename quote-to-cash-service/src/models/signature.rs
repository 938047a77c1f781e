//! Signature model shared by quotes and change orders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::text_enum;

/// Party a signature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerRole {
    Customer,
    CompanyRep,
}

text_enum!(SignerRole, "signer role", {
    Customer => "customer",
    CompanyRep => "company_rep",
});

impl SignerRole {
    /// Human wording used in "already signed by X" responses.
    pub fn label(&self) -> &'static str {
        match self {
            SignerRole::Customer => "the customer",
            SignerRole::CompanyRep => "a company representative",
        }
    }
}

/// Kind of financial document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Quote,
    ChangeOrder,
    Contract,
    Invoice,
}

text_enum!(DocumentKind, "document kind", {
    Quote => "quote",
    ChangeOrder => "change_order",
    Contract => "contract",
    Invoice => "invoice",
});

/// A captured signature. At most one per (document, role).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Signature {
    pub signature_id: Uuid,
    pub company_id: Uuid,
    #[sqlx(try_from = "String")]
    pub document_kind: DocumentKind,
    pub document_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: SignerRole,
    pub signer_name: String,
    pub signer_title: Option<String>,
    #[serde(skip_serializing)]
    pub signature_image: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub signed_by_user_id: Option<Uuid>,
    pub signed_utc: DateTime<Utc>,
}

/// Signature as submitted by a signer, before validation.
#[derive(Debug, Clone, Default)]
pub struct SignaturePayload {
    pub signer_name: String,
    pub signer_title: Option<String>,
    /// Rendered signature as a `data:image/...;base64,` URL.
    pub signature_image: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Validated signature ready to persist.
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub company_id: Uuid,
    pub document_kind: DocumentKind,
    pub document_id: Uuid,
    pub role: SignerRole,
    pub signer_name: String,
    pub signer_title: Option<String>,
    pub signature_image: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub signed_by_user_id: Option<Uuid>,
    pub signed_utc: DateTime<Utc>,
}

impl NewSignature {
    pub fn into_signature(self, signature_id: Uuid) -> Signature {
        Signature {
            signature_id,
            company_id: self.company_id,
            document_kind: self.document_kind,
            document_id: self.document_id,
            role: self.role,
            signer_name: self.signer_name,
            signer_title: self.signer_title,
            signature_image: self.signature_image,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            signed_by_user_id: self.signed_by_user_id,
            signed_utc: self.signed_utc,
        }
    }
}
