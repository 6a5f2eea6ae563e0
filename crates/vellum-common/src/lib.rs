//! # vellum-common
//!
//! Common types, errors, and utilities for Vellum.
//!
//! This crate provides the foundational types shared by every Vellum
//! component:
//!
//! - **Types**: storage refs, snapshot identifiers (`VersionId`), table,
//!   column and object keys, and the dynamically typed `Mixed` value
//! - **Errors**: stable `ErrorCode`s and the `Status` value carried by
//!   asynchronous error callbacks
//! - **Config**: database and sync client configuration structures
//! - **Sync**: typed mutex wrappers enforcing a lock-ordering discipline
//! - **Constants**: system-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use vellum_common::types::{ColKey, ColumnAttrs, ColumnType, Mixed, ObjKey};
//!
//! let col = ColKey::new(3, ColumnType::Int, ColumnAttrs::NULLABLE, 7);
//! assert_eq!(col.index(), 3);
//! assert_eq!(col.column_type(), ColumnType::Int);
//!
//! let key = ObjKey::new(42);
//! assert_eq!(Mixed::from(key), Mixed::Link(key));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod sync;
pub mod types;

// Re-export commonly used items at the crate root
pub use error::{ErrorCode, Status};
pub use types::{
    ColKey, ColumnAttrs, ColumnType, HistoryType, Mixed, ObjKey, ObjLink, Ref, TableKey,
    Timestamp, VersionId,
};
