pub mod attestation;
pub mod capability;
pub mod classifier;
pub mod ctx;
pub mod error;
pub mod keys;
pub mod model;
pub mod redis_codec;
pub mod scripts;

pub use attestation::{completion_attestation, failure_attestation, scrub, AttestationInput};
pub use capability::matches as capability_matches;
pub use classifier::{classify, ClassifyContext, Classification, FailureType};
pub use ctx::extract_retry_attempt;
pub use error::{JobMeshError, Result};
pub use model::*;
