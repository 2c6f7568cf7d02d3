//! `jobrelay-core`: shared primitives for the job relay.
//!
//! Identifiers, the domain error model and the optimistic version check used at
//! the store boundary. No IO lives here.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use version::ExpectedVersion;
