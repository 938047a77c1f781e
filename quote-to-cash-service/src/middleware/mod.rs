pub mod company;
pub mod validation;

pub use company::{ClientInfo, CompanyContext};
pub use validation::ValidatedJson;
