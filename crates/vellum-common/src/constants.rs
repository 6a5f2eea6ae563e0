//! System-wide constants for Vellum.
//!
//! Limits and defaults shared by the allocator, the node layer, the
//! transaction layer and the sync client.

// =============================================================================
// Allocator Constants
// =============================================================================

/// Every ref and every allocation size is a multiple of this.
pub const REF_ALIGNMENT: u64 = 8;

/// Log2 of the section size used by the ref translation table.
pub const SECTION_SHIFT: u32 = 16;

/// Size of one translation section of the committed file image (64 KB).
///
/// Committed nodes never straddle a section boundary unless they are
/// larger than a section, in which case they are served through the
/// cross-over (xover) slow path.
pub const SECTION_SIZE: u64 = 1 << SECTION_SHIFT;

/// Minimum size of a newly allocated slab (mutable memory) in bytes.
pub const MIN_SLAB_SIZE: usize = 16 * 1024;

/// Default upper bound on mutable memory a single write may allocate (1 GB).
pub const DEFAULT_MAX_SLAB_BYTES: usize = 1024 * 1024 * 1024;

/// Offset of the first node in a file image.
///
/// The first bytes hold the file header, so no node ever has a ref below
/// this value and `0` stays free to mean null.
pub const FILE_HEADER_SIZE: u64 = 24;

// =============================================================================
// Node Constants
// =============================================================================

/// Size of the header in front of every array node.
pub const NODE_HEADER_SIZE: usize = 8;

/// Largest number of elements a single node can hold (24-bit size field).
pub const MAX_NODE_SIZE: usize = 0x00FF_FFFF;

/// Default maximum number of elements in a B+Tree leaf.
pub const DEFAULT_MAX_LEAF_SIZE: usize = 1000;

/// Default maximum number of children of a B+Tree inner node.
pub const DEFAULT_MAX_INNER_SIZE: usize = 1000;

// =============================================================================
// File Format Constants
// =============================================================================

/// Mnemonic identifying a Vellum file.
pub const FILE_MNEMONIC: [u8; 4] = *b"V-DB";

/// Current on-disk file format version.
pub const FILE_FORMAT_VERSION: u8 = 1;

/// Current schema version of the in-file history.
pub const HISTORY_SCHEMA_VERSION: u32 = 2;

// =============================================================================
// Sync Constants
// =============================================================================

/// Default initial reconnect delay (1 second).
pub const DEFAULT_RESUMPTION_DELAY_MS: u64 = 1_000;

/// Default maximum reconnect delay (5 minutes).
pub const DEFAULT_MAX_RESUMPTION_DELAY_MS: u64 = 5 * 60 * 1_000;

/// Default multiplier applied to the reconnect delay after each failure.
pub const DEFAULT_RESUMPTION_BACKOFF_MULTIPLIER: u32 = 2;

/// Default jitter divisor: up to `1/4` of a delay may be subtracted.
pub const DEFAULT_DELAY_JITTER_DIVISOR: u32 = 4;

/// Default window after a disconnect within which a reconnect counts as fast.
pub const DEFAULT_FAST_RECONNECT_LIMIT_MS: u64 = 60 * 1_000;
