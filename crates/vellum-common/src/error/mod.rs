//! Error handling for Vellum.
//!
//! Each crate defines its own error enum; this module provides the stable
//! [`ErrorCode`] they all map onto and the [`Status`] value delivered through
//! asynchronous callbacks (sync session errors, async commit results).

mod codes;

pub use codes::{ErrorCategory, ErrorCode, Status};
