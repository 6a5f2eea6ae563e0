//! Vellum performance benchmarks
//!
//! - B+Tree inserts, lookups, aggregates and erases
//! - Changeset encoding and parsing, sync message framing
//! - Write transactions and changeset integration
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p vellum-bench
//! ```

pub mod utils;
