//! Signature payload validation. No I/O: callers persist the result.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::LifecycleError;
use crate::models::{DocumentKind, NewSignature, SignaturePayload, SignerRole};

const MAX_SIGNER_NAME_LEN: usize = 200;
const MAX_SIGNATURE_BYTES: usize = 512 * 1024;

/// The document and party a signature is being captured for.
#[derive(Debug, Clone, Copy)]
pub struct SignatureTarget {
    pub company_id: Uuid,
    pub document_kind: DocumentKind,
    pub document_id: Uuid,
    pub role: SignerRole,
    /// Whether `role` already signed this document.
    pub already_signed: bool,
    pub signed_by_user_id: Option<Uuid>,
}

/// Validate `payload` against the target document and build the row to persist.
pub fn capture(
    payload: &SignaturePayload,
    target: SignatureTarget,
    now: DateTime<Utc>,
) -> Result<NewSignature, LifecycleError> {
    if target.already_signed {
        return Err(LifecycleError::DuplicateSubmission(target.role));
    }

    let signer_name = payload.signer_name.trim();
    if signer_name.is_empty() {
        return Err(LifecycleError::validation("Signer name is required"));
    }
    if signer_name.chars().count() > MAX_SIGNER_NAME_LEN {
        return Err(LifecycleError::validation("Signer name is too long"));
    }
    if target.role == SignerRole::CompanyRep && target.signed_by_user_id.is_none() {
        return Err(LifecycleError::validation(
            "Company signatures require an acting user",
        ));
    }
    validate_image(&payload.signature_image)?;

    Ok(NewSignature {
        company_id: target.company_id,
        document_kind: target.document_kind,
        document_id: target.document_id,
        role: target.role,
        signer_name: signer_name.to_string(),
        signer_title: payload
            .signer_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        signature_image: payload.signature_image.clone(),
        ip_address: payload.ip_address.clone(),
        user_agent: payload.user_agent.clone(),
        signed_by_user_id: target.signed_by_user_id,
        signed_utc: now,
    })
}

/// Accepts `data:image/<type>;base64,<data>` with a non-empty, bounded payload.
fn validate_image(image: &str) -> Result<(), LifecycleError> {
    let invalid = || LifecycleError::validation("Signature image must be a base64 image data URL");

    let rest = image.strip_prefix("data:image/").ok_or_else(invalid)?;
    let (_media_type, data) = rest.split_once(";base64,").ok_or_else(invalid)?;
    let bytes = STANDARD.decode(data.trim()).map_err(|_| invalid())?;
    if bytes.is_empty() {
        return Err(LifecycleError::validation("Signature image is empty"));
    }
    if bytes.len() > MAX_SIGNATURE_BYTES {
        return Err(LifecycleError::validation("Signature image is too large"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

    fn target(role: SignerRole) -> SignatureTarget {
        SignatureTarget {
            company_id: Uuid::new_v4(),
            document_kind: DocumentKind::Quote,
            document_id: Uuid::new_v4(),
            role,
            already_signed: false,
            signed_by_user_id: None,
        }
    }

    fn payload(name: &str, image: &str) -> SignaturePayload {
        SignaturePayload {
            signer_name: name.to_string(),
            signature_image: image.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_well_formed_customer_signature() {
        let signature = capture(&payload("  Dana Roof  ", PNG), target(SignerRole::Customer), Utc::now())
            .unwrap();
        assert_eq!(signature.signer_name, "Dana Roof");
        assert_eq!(signature.role, SignerRole::Customer);
    }

    #[test]
    fn duplicate_is_reported_before_payload_problems() {
        let mut t = target(SignerRole::Customer);
        t.already_signed = true;
        let err = capture(&payload("", ""), t, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::DuplicateSubmission(SignerRole::Customer)
        ));
    }

    #[test]
    fn rejects_blank_name_and_bad_images() {
        let t = target(SignerRole::Customer);
        assert!(matches!(
            capture(&payload(" ", PNG), t, Utc::now()),
            Err(LifecycleError::ValidationError(_))
        ));
        for image in [
            "",
            "https://example.com/sig.png",
            "data:image/png;base64,",
            "data:image/png;base64,@@@",
            "data:text/plain;base64,aGVsbG8=",
        ] {
            assert!(
                matches!(
                    capture(&payload("Dana", image), t, Utc::now()),
                    Err(LifecycleError::ValidationError(_))
                ),
                "accepted {image:?}"
            );
        }
    }

    #[test]
    fn company_signature_needs_acting_user() {
        let mut t = target(SignerRole::CompanyRep);
        assert!(capture(&payload("Rep", PNG), t, Utc::now()).is_err());
        t.signed_by_user_id = Some(Uuid::new_v4());
        assert!(capture(&payload("Rep", PNG), t, Utc::now()).is_ok());
    }
}
