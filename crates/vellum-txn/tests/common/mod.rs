//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use vellum_common::config::DbConfig;
use vellum_txn::Db;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`; safe to call from
/// every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Opens an in-memory database with small nodes.
pub fn memory_db() -> Db {
    init_tracing();
    Db::open(DbConfig::for_testing()).expect("open in-memory db")
}
