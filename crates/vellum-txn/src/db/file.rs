//! On-disk image for `Durability::Full`.
//!
//! ```text
//! 0..8    top ref slot 0
//! 8..16   top ref slot 1
//! 16..20  mnemonic "V-DB"
//! 20      file format version
//! 21..23  reserved
//! 23      selector: which slot holds the current top ref
//! ```
//!
//! A commit writes the node bytes first, syncs, then writes the header with
//! the new top ref in the slot the selector does not point at and flips the
//! selector, and syncs again. A crash before the second sync leaves the
//! previous snapshot reachable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vellum_common::constants::{FILE_FORMAT_VERSION, FILE_HEADER_SIZE, FILE_MNEMONIC};
use vellum_common::types::Ref;
use vellum_storage::Mapping;

use crate::error::{TxnError, TxnResult};

const HEADER_LEN: usize = FILE_HEADER_SIZE as usize;

/// Builds the 24-byte header.
pub(crate) fn encode_header(slots: [u64; 2], selector: u8) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..8].copy_from_slice(&slots[0].to_le_bytes());
    out[8..16].copy_from_slice(&slots[1].to_le_bytes());
    out[16..20].copy_from_slice(&FILE_MNEMONIC);
    out[20] = FILE_FORMAT_VERSION;
    out[23] = selector & 1;
    out
}

/// Parses a header, returning both slots and the selector.
pub(crate) fn decode_header(bytes: &[u8]) -> TxnResult<([u64; 2], u8)> {
    if bytes.len() < HEADER_LEN {
        return Err(TxnError::Corrupted(format!(
            "file header needs {HEADER_LEN} bytes, found {}",
            bytes.len()
        )));
    }
    if bytes[16..20] != FILE_MNEMONIC {
        return Err(TxnError::Corrupted("bad file mnemonic".into()));
    }
    if bytes[20] != FILE_FORMAT_VERSION {
        return Err(TxnError::Corrupted(format!(
            "unsupported file format {}",
            bytes[20]
        )));
    }
    let slot = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(b)
    };
    let selector = bytes[23];
    if selector > 1 {
        return Err(TxnError::Corrupted(format!("bad selector {selector}")));
    }
    Ok(([slot(0), slot(8)], selector))
}

/// The backing file of a durable database.
pub(crate) struct DbFile {
    file: File,
    path: PathBuf,
    slots: [u64; 2],
    selector: u8,
    persisted_version: Option<u64>,
    #[cfg(test)]
    pub(crate) fail_next_persist: bool,
}

impl std::fmt::Debug for DbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbFile")
            .field("path", &self.path)
            .field("selector", &self.selector)
            .finish()
    }
}

impl DbFile {
    /// Opens `path`, creating an empty file if needed. Returns the image
    /// and top ref of the latest snapshot if the file had one.
    pub(crate) fn open_or_create(path: &Path) -> TxnResult<(Self, Option<(Mapping, Ref)>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.is_empty() {
            let header = encode_header([0, 0], 0);
            file.write_all(&header)?;
            file.sync_all()?;
            info!(path = %path.display(), "created database file");
            let db_file = Self {
                file,
                path: path.to_path_buf(),
                slots: [0, 0],
                selector: 0,
                persisted_version: None,
                #[cfg(test)]
                fail_next_persist: false,
            };
            return Ok((db_file, None));
        }

        let (slots, selector) = decode_header(&bytes)?;
        let top = Ref::new(slots[usize::from(selector)]);
        let db_file = Self {
            file,
            path: path.to_path_buf(),
            slots,
            selector,
            persisted_version: None,
            #[cfg(test)]
            fail_next_persist: false,
        };
        if top.is_null() {
            return Ok((db_file, None));
        }
        if top.as_u64() >= bytes.len() as u64 {
            return Err(TxnError::Corrupted(format!(
                "top ref {top:?} beyond end of file ({} bytes)",
                bytes.len()
            )));
        }
        let mapping = Mapping::from_bytes(&bytes, top)?;
        info!(path = %path.display(), size = bytes.len(), ?top, "opened database file");
        Ok((db_file, Some((mapping, top))))
    }

    /// Writes `mapping` and makes `top_ref` the current snapshot. Versions
    /// older than one already persisted are skipped.
    pub(crate) fn persist(&mut self, mapping: &Mapping, top_ref: Ref, version: u64) -> TxnResult<()> {
        if self.persisted_version.is_some_and(|v| v > version) {
            return Ok(());
        }
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_persist) {
            return Err(std::io::Error::other("injected write failure").into());
        }
        let bytes = mapping.to_bytes();
        if bytes.len() > HEADER_LEN {
            self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
            self.file.write_all(&bytes[HEADER_LEN..])?;
        }
        self.file.set_len(bytes.len().max(HEADER_LEN) as u64)?;
        self.file.sync_data()?;

        let next = 1 - self.selector;
        let mut slots = self.slots;
        slots[usize::from(next)] = top_ref.as_u64();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encode_header(slots, next))?;
        self.file.sync_data()?;

        self.slots = slots;
        self.selector = next;
        self.persisted_version = Some(version);
        debug!(version, ?top_ref, size = bytes.len(), selector = next, "snapshot persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let h = encode_header([0x40, 0x1000], 1);
        assert_eq!(&h[16..20], b"V-DB");
        assert_eq!(h[23], 1);
        let (slots, sel) = decode_header(&h).unwrap();
        assert_eq!(slots, [0x40, 0x1000]);
        assert_eq!(sel, 1);

        let mut bad = h;
        bad[16] = b'X';
        assert!(matches!(decode_header(&bad), Err(TxnError::Corrupted(_))));
        assert!(decode_header(&h[..10]).is_err());
    }

    #[test]
    fn test_create_then_reopen_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.vellum");
        let (file, existing) = DbFile::open_or_create(&path).unwrap();
        assert!(existing.is_none());
        drop(file);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), FILE_HEADER_SIZE);
        let (_, existing) = DbFile::open_or_create(&path).unwrap();
        assert!(existing.is_none());
    }
}
