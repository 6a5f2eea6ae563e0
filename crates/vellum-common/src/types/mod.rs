//! Type definitions for Vellum.
//!
//! This module contains all core type definitions used across the database.

mod ids;
mod keys;
mod mixed;

pub use ids::{HistoryType, Ref, VersionId};
pub use keys::{ColKey, ColumnAttrs, ColumnType, ObjKey, ObjLink, TableKey};
pub use mixed::{Mixed, MixedType, Timestamp};
