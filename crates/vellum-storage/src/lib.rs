//! # vellum-storage
//!
//! Ref-based storage engine for Vellum.
//!
//! This crate provides:
//!
//! - **Allocator**: [`SlabAlloc`] translating refs into committed file
//!   image sections or private writable slabs, and [`FileImage`] placing
//!   committed nodes into section-aligned file space
//! - **Array**: packed, width-adaptive integer nodes and raw blob nodes
//! - **B+Tree**: [`BPlusTree<T>`] over integer, nullable, string, binary
//!   and `Mixed` leaves with aggregates and structural verification
//! - **Collections**: list, link list, set and dictionary cores reporting
//!   mutations through a [`CollectionHook`]
//!
//! ## Example
//!
//! ```rust
//! use vellum_storage::{BPlusTree, SlabAlloc, TreeConfig};
//!
//! let mut alloc = SlabAlloc::new_writable();
//! let mut tree = BPlusTree::<i64>::create(&mut alloc, TreeConfig::default()).unwrap();
//! for v in 0..10 {
//!     tree.add(&mut alloc, &v).unwrap();
//! }
//! assert_eq!(tree.get(&alloc, 7).unwrap(), 7);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod array;
pub mod bptree;
pub mod collection;
pub mod error;

pub use alloc::{FileImage, ImageWriter, Mapping, MemRef, SlabAlloc, SlabConfig};
pub use array::{Array, ArrayBlob, ArrayType, ArrayWriter, RefOrTagged};
pub use bptree::{BPlusTree, IteratorControl, TreeConfig, TreeValue};
pub use collection::{CollectionHook, DictionaryCore, LnkLst, LstCore, NoHook, SetCore};
pub use error::{StorageError, StorageResult};
