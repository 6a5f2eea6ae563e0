//! Ref-based memory management.
//!
//! - [`FileImage`] holds the committed image shared by every transaction
//!   of a database and the list of released file space.
//! - [`SlabAlloc`] is a per-transaction view: it translates committed refs
//!   through an immutable [`Mapping`] and serves new allocations from
//!   private slabs.
//! - [`ImageWriter`] places the nodes written by a commit into file space.

mod image;
mod slab;

pub use image::{FileImage, FreeChunk, ImageWriter, Mapping};
pub use slab::{Chunk, MemRef, SlabAlloc, SlabConfig};
