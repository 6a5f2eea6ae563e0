//! Synchronization primitives.

mod guarded;

pub use guarded::{held_locks, Guarded, GuardedRef, LockTag};
