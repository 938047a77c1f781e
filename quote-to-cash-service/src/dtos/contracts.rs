use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct VoidContractRequest {
    #[validate(length(min = 1, max = 1000, message = "A reason is required"))]
    pub reason: String,
}
