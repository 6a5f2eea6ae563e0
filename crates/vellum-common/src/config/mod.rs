//! Configuration for Vellum.
//!
//! This module provides configuration structures for the database engine
//! and for the sync client.

mod database;
mod sync;

pub use database::{DbConfig, Durability};
pub use sync::{ClientResyncMode, StopPolicy, SyncClientConfig, SyncConfig, SyncMode};
