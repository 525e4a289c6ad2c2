pub mod rate_limit;
pub mod token;
pub mod verifier;

pub use rate_limit::RateWindowLimiter;
pub use token::{sign_claims, Capability, CapabilityToken, Constraint, KeySource, Resource};
pub use verifier::{AdmissionCheck, CapabilityVerifier};
