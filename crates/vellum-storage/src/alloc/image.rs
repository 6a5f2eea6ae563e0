//! Committed file image and its translation table.
//!
//! The committed part of the database is a sequence of fixed-size
//! sections. A [`Mapping`] is an immutable view of those sections at one
//! version; a commit builds the next mapping by copying only the sections
//! it touches, so readers holding an older mapping keep a consistent view.
//! The latest mapping is published through [`FileImage::publish`] by
//! swapping an `Arc` under a lock, which makes the translation table
//! appear atomically to every reader.
//!
//! Nodes never straddle a section boundary, except nodes larger than a
//! section. Those start at a section boundary and are additionally kept as
//! one contiguous "xover" copy attached to their first section.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, trace};

use vellum_common::constants::{FILE_HEADER_SIZE, SECTION_SHIFT, SECTION_SIZE};
use vellum_common::types::Ref;

use crate::array::header::NodeHeader;
use crate::array::width::getter_for_width;
use crate::array::writer::ArrayWriter;
use crate::error::{StorageError, StorageResult};

/// One section of the committed image.
#[derive(Clone)]
pub(crate) struct Section {
    data: Arc<Vec<u8>>,
    xover: Option<Arc<Vec<u8>>>,
}

impl Section {
    fn zeroed() -> Self {
        Self {
            data: Arc::new(vec![0; SECTION_SIZE as usize]),
            xover: None,
        }
    }
}

/// Immutable translation table for one committed version.
#[derive(Clone)]
pub struct Mapping {
    sections: Vec<Section>,
    size: u64,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("sections", &self.sections.len())
            .field("size", &self.size)
            .finish()
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Self::empty()
    }
}

impl Mapping {
    /// Creates a mapping holding only the file header.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sections: vec![Section::zeroed()],
            size: FILE_HEADER_SIZE,
        }
    }

    /// Logical size of the committed image in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of sections.
    #[must_use]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Translates a committed ref. The returned slice starts at the node
    /// and extends at least to its end.
    #[inline]
    pub fn translate(&self, r: Ref) -> &[u8] {
        let offset = r.as_u64();
        let ndx = (offset >> SECTION_SHIFT) as usize;
        let within = (offset & (SECTION_SIZE - 1)) as usize;
        match self.sections.get(ndx) {
            Some(section) => {
                if within == 0 {
                    if let Some(xover) = &section.xover {
                        return xover.as_slice();
                    }
                }
                &section.data[within..]
            }
            None => &[],
        }
    }

    /// Returns true if `r` lies within the committed image.
    #[must_use]
    pub fn contains(&self, r: Ref) -> bool {
        !r.is_null() && r.as_u64() < self.size
    }

    /// Flattens the image into one buffer of `size()` bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for section in &self.sections {
            let remaining = self.size as usize - out.len();
            if remaining == 0 {
                break;
            }
            let take = remaining.min(section.data.len());
            out.extend_from_slice(&section.data[..take]);
        }
        out
    }

    /// Rebuilds a mapping from a flat image, registering every oversized
    /// node reachable from `top_ref` as an xover node.
    pub fn from_bytes(bytes: &[u8], top_ref: Ref) -> StorageResult<Self> {
        let mut mapping = Self {
            sections: Vec::new(),
            size: bytes.len() as u64,
        };
        for chunk in bytes.chunks(SECTION_SIZE as usize) {
            let mut data = vec![0; SECTION_SIZE as usize];
            data[..chunk.len()].copy_from_slice(chunk);
            mapping.sections.push(Section {
                data: Arc::new(data),
                xover: None,
            });
        }
        if mapping.sections.is_empty() {
            mapping.sections.push(Section::zeroed());
        }
        if !top_ref.is_null() {
            let mut oversized = Vec::new();
            collect_oversized(bytes, top_ref, &mut oversized)?;
            for r in oversized {
                let start = r.as_u64() as usize;
                let header = NodeHeader::parse(&bytes[start..])
                    .ok_or_else(|| StorageError::corrupted(r, "truncated header"))?;
                let end = start + header.capacity;
                let ndx = start >> SECTION_SHIFT;
                mapping.sections[ndx].xover = Some(Arc::new(bytes[start..end].to_vec()));
            }
        }
        debug!(
            size = mapping.size,
            sections = mapping.sections.len(),
            "rebuilt mapping from file image"
        );
        Ok(mapping)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) {
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let ndx = (pos >> SECTION_SHIFT) as usize;
            while self.sections.len() <= ndx {
                self.sections.push(Section::zeroed());
            }
            let within = (pos & (SECTION_SIZE - 1)) as usize;
            let take = (SECTION_SIZE as usize - within).min(data.len() - written);
            let section = Arc::make_mut(&mut self.sections[ndx].data);
            section[within..within + take].copy_from_slice(&data[written..written + take]);
            written += take;
        }
    }

    fn clear_xover(&mut self, offset: u64) {
        if offset & (SECTION_SIZE - 1) == 0 {
            if let Some(section) = self.sections.get_mut((offset >> SECTION_SHIFT) as usize) {
                section.xover = None;
            }
        }
    }
}

fn collect_oversized(bytes: &[u8], r: Ref, out: &mut Vec<Ref>) -> StorageResult<()> {
    let start = r.as_u64() as usize;
    if !r.is_aligned() || start >= bytes.len() {
        return Err(StorageError::InvalidRef(r));
    }
    let header = NodeHeader::parse(&bytes[start..])
        .ok_or_else(|| StorageError::corrupted(r, "truncated header"))?;
    if start + header.capacity > bytes.len() {
        return Err(StorageError::corrupted(r, "node extends past end of file"));
    }
    let within = start & (SECTION_SIZE as usize - 1);
    if within + header.capacity > SECTION_SIZE as usize {
        out.push(r);
    }
    if header.has_refs {
        let getter = getter_for_width(header.width);
        let data = &bytes[start + header.byte_offset()..start + header.capacity];
        for i in 0..header.size {
            let v = getter(data, i);
            if v != 0 && v & 1 == 0 {
                collect_oversized(bytes, Ref::from_slot(v), out)?;
            }
        }
    }
    Ok(())
}

/// A released range of committed file space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    /// Start of the range.
    pub ref_: u64,
    /// Length in bytes.
    pub size: u64,
    /// Version whose commit released the range. The range is still
    /// visible to snapshots older than this version.
    pub freed_version: u64,
}

/// The shared committed image of one database.
pub struct FileImage {
    current: RwLock<Arc<Mapping>>,
    free_space: Mutex<Vec<FreeChunk>>,
}

impl Default for FileImage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileImage")
            .field("size", &self.current.read().size)
            .field("free_chunks", &self.free_space.lock().len())
            .finish()
    }
}

impl FileImage {
    /// Creates an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mapping(Mapping::empty())
    }

    /// Creates an image around an existing mapping.
    #[must_use]
    pub fn with_mapping(mapping: Mapping) -> Self {
        Self {
            current: RwLock::new(Arc::new(mapping)),
            free_space: Mutex::new(Vec::new()),
        }
    }

    /// Returns the latest published mapping.
    #[must_use]
    pub fn current(&self) -> Arc<Mapping> {
        Arc::clone(&self.current.read())
    }

    /// Publishes a new mapping.
    pub fn publish(&self, mapping: Mapping) -> Arc<Mapping> {
        let mapping = Arc::new(mapping);
        *self.current.write() = Arc::clone(&mapping);
        mapping
    }

    /// Records ranges released by the commit of `freed_version`.
    pub fn release(&self, chunks: impl IntoIterator<Item = (u64, u64)>, freed_version: u64) {
        let mut free = self.free_space.lock();
        for (start, size) in chunks {
            split_at_sections(start, size, |ref_, size| {
                free.push(FreeChunk {
                    ref_,
                    size,
                    freed_version,
                });
            });
        }
    }

    /// Total bytes on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_space.lock().iter().map(|c| c.size).sum()
    }

    /// Number of free ranges on the free list.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        self.free_space.lock().len()
    }

    /// Starts placing the nodes of a commit.
    ///
    /// Only ranges released at or before `oldest_live_version` are reused,
    /// since no live snapshot can still reach them.
    pub fn writer(&self, oldest_live_version: u64) -> ImageWriter<'_> {
        let mut free = self.free_space.lock();
        let (reusable, pinned): (Vec<_>, Vec<_>) = free
            .drain(..)
            .partition(|c| c.freed_version <= oldest_live_version);
        *free = pinned;
        trace!(
            reusable = reusable.len(),
            oldest_live_version,
            "collected reusable file space"
        );
        ImageWriter {
            image: self,
            mapping: (*self.current()).clone(),
            reusable,
            finished: false,
        }
    }
}

fn split_at_sections(start: u64, size: u64, mut f: impl FnMut(u64, u64)) {
    let mut pos = start;
    let end = start + size;
    while pos < end {
        let boundary = ((pos >> SECTION_SHIFT) + 1) << SECTION_SHIFT;
        let piece_end = boundary.min(end);
        f(pos, piece_end - pos);
        pos = piece_end;
    }
}

/// Places the nodes of one commit into file space.
pub struct ImageWriter<'a> {
    image: &'a FileImage,
    mapping: Mapping,
    reusable: Vec<FreeChunk>,
    finished: bool,
}

impl ImageWriter<'_> {
    /// Size of the image being built.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.mapping.size
    }

    /// Overwrites the reserved header area.
    pub fn write_header(&mut self, header: &[u8]) {
        let len = header.len().min(FILE_HEADER_SIZE as usize);
        self.mapping.write_at(0, &header[..len]);
    }

    /// Returns the built mapping without publishing it, keeping unused
    /// reusable space on the free list.
    pub fn finish(mut self) -> Mapping {
        self.finished = true;
        self.return_unused();
        std::mem::take(&mut self.mapping)
    }

    fn return_unused(&mut self) {
        if self.reusable.is_empty() {
            return;
        }
        let mut free = self.image.free_space.lock();
        free.append(&mut self.reusable);
    }

    fn place(&mut self, len: u64) -> u64 {
        if len <= SECTION_SIZE {
            if let Some(pos) = self.reusable.iter().position(|c| c.size >= len) {
                let chunk = &mut self.reusable[pos];
                let at = chunk.ref_;
                chunk.ref_ += len;
                chunk.size -= len;
                if chunk.size == 0 {
                    self.reusable.swap_remove(pos);
                }
                self.mapping.clear_xover(at);
                return at;
            }
        }
        let size = self.mapping.size;
        let within = size & (SECTION_SIZE - 1);
        let needs_boundary = if len > SECTION_SIZE {
            within != 0
        } else {
            within + len > SECTION_SIZE
        };
        let at = if needs_boundary {
            let boundary = ((size >> SECTION_SHIFT) + 1) << SECTION_SHIFT;
            self.reusable.push(FreeChunk {
                ref_: size,
                size: boundary - size,
                freed_version: 0,
            });
            boundary
        } else {
            size
        };
        self.mapping.size = at + len;
        at
    }
}

impl ArrayWriter for ImageWriter<'_> {
    fn write_array(&mut self, data: &[u8]) -> StorageResult<Ref> {
        let len = ((data.len() as u64) + 7) & !7;
        let at = self.place(len);
        self.mapping.write_at(at, data);
        if len > SECTION_SIZE {
            let ndx = (at >> SECTION_SHIFT) as usize;
            let mut copy = data.to_vec();
            copy.resize(len as usize, 0);
            self.mapping.sections[ndx].xover = Some(Arc::new(copy));
        }
        Ok(Ref::new(at))
    }
}

impl Drop for ImageWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.return_unused();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(len: usize, fill: u8) -> Vec<u8> {
        let mut bytes = vec![fill; len];
        // blob header: capacity, flags (ignore width type), size
        let header = NodeHeader::blob(len, len - 8);
        header.write(&mut bytes[..8]);
        bytes
    }

    #[test]
    fn test_append_and_translate() {
        let image = FileImage::new();
        let mut writer = image.writer(0);
        let r = writer.write_array(&node(32, 7)).unwrap();
        assert_eq!(r.as_u64(), FILE_HEADER_SIZE);
        let mapping = image.publish(writer.finish());
        assert_eq!(mapping.size(), FILE_HEADER_SIZE + 32);
        assert_eq!(mapping.translate(r)[8], 7);
    }

    #[test]
    fn test_section_alignment_padding() {
        let image = FileImage::new();
        let mut writer = image.writer(0);
        let first = writer
            .write_array(&node(SECTION_SIZE as usize - 64, 1))
            .unwrap();
        let second = writer.write_array(&node(128, 2)).unwrap();
        assert_eq!(first.as_u64(), FILE_HEADER_SIZE);
        assert_eq!(second.as_u64(), SECTION_SIZE);
        let mapping = writer.finish();
        assert_eq!(mapping.translate(second)[8], 2);
        // padding before the boundary is reusable by the next commit
        assert_eq!(image.free_chunk_count(), 1);
    }

    #[test]
    fn test_xover_node() {
        let image = FileImage::new();
        let mut writer = image.writer(0);
        let big = node(SECTION_SIZE as usize + 800, 9);
        let r = writer.write_array(&big).unwrap();
        assert_eq!(r.as_u64(), SECTION_SIZE);
        let mapping = writer.finish();
        let slice = mapping.translate(r);
        assert!(slice.len() >= big.len());
        assert_eq!(slice[big.len() - 1], 9);

        let flat = mapping.to_bytes();
        let rebuilt = Mapping::from_bytes(&flat, r).unwrap();
        assert_eq!(rebuilt.translate(r)[big.len() - 1], 9);
    }

    #[test]
    fn test_free_space_reuse_respects_readers() {
        let image = FileImage::new();
        let mut writer = image.writer(0);
        let r = writer.write_array(&node(64, 1)).unwrap();
        image.publish(writer.finish());

        image.release([(r.as_u64(), 64)], 2);
        let mut writer = image.writer(1);
        let pinned = writer.write_array(&node(64, 2)).unwrap();
        assert_ne!(pinned, r);
        drop(writer);

        let mut writer = image.writer(2);
        let reused = writer.write_array(&node(64, 3)).unwrap();
        assert_eq!(reused, r);
    }

    #[test]
    fn test_old_mapping_unaffected_by_new_commit() {
        let image = FileImage::new();
        let mut writer = image.writer(0);
        let r = writer.write_array(&node(64, 1)).unwrap();
        let old = image.publish(writer.finish());

        image.release([(r.as_u64(), 64)], 1);
        let mut writer = image.writer(1);
        assert_eq!(writer.write_array(&node(64, 5)).unwrap(), r);
        let new = image.publish(writer.finish());
        assert_eq!(old.translate(r)[8], 1);
        assert_eq!(new.translate(r)[8], 5);
    }
}
