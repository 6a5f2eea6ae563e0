//! Node header layout.
//!
//! Layout (8 bytes):
//! - capacity: u24 LE (bytes 0..3) - allocated bytes including the header
//! - reserved: u8 (byte 3)
//! - flags: u8 (byte 4)
//!   - bit 7: inner B+Tree node
//!   - bit 6: has refs
//!   - bit 5: context flag
//!   - bits 3..5: width type
//!   - bits 0..3: width index into {0, 1, 2, 4, 8, 16, 32, 64}
//! - size: u24 LE (bytes 5..8) - element count, or byte count for blobs

use vellum_common::constants::NODE_HEADER_SIZE;

/// Encoding of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WidthType {
    /// Packed integers of `width` bits each.
    Bits = 0,
    /// Fixed-size elements of `width` bytes each.
    Multiply = 1,
    /// Raw bytes; `size` counts bytes.
    Ignore = 2,
}

impl WidthType {
    /// Converts the two header bits into a width type.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Bits),
            1 => Some(Self::Multiply),
            2 => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Node is an inner B+Tree node.
    pub const INNER_BPTREE: Self = Self(1 << 7);
    /// Even non-zero slots are refs owned by this node.
    pub const HAS_REFS: Self = Self(1 << 6);
    /// Free bit for the owner's use.
    pub const CONTEXT: Self = Self(1 << 5);

    /// Checks if a flag is set.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Widths a packed array may use, indexed by the three header bits.
pub const WIDTHS: [u8; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Allocated bytes, header included.
    pub capacity: usize,
    /// Inner B+Tree node flag.
    pub is_inner_bptree: bool,
    /// Has-refs flag.
    pub has_refs: bool,
    /// Context flag.
    pub context_flag: bool,
    /// Payload encoding.
    pub width_type: WidthType,
    /// Element width in bits (`Bits`) or bytes (`Multiply`).
    pub width: u8,
    /// Number of elements.
    pub size: usize,
}

impl NodeHeader {
    /// Header of a raw byte node.
    #[must_use]
    pub fn blob(capacity: usize, size: usize) -> Self {
        Self {
            capacity,
            is_inner_bptree: false,
            has_refs: false,
            context_flag: false,
            width_type: WidthType::Ignore,
            width: 0,
            size,
        }
    }

    /// Parses a header from the first bytes of a node.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return None;
        }
        let flags = bytes[4];
        Some(Self {
            capacity: read_u24(&bytes[0..3]),
            is_inner_bptree: HeaderFlags(flags).contains(HeaderFlags::INNER_BPTREE),
            has_refs: HeaderFlags(flags).contains(HeaderFlags::HAS_REFS),
            context_flag: HeaderFlags(flags).contains(HeaderFlags::CONTEXT),
            width_type: WidthType::from_bits((flags >> 3) & 0x3)?,
            width: WIDTHS[(flags & 0x7) as usize],
            size: read_u24(&bytes[5..8]),
        })
    }

    /// Writes the header into the first bytes of a node.
    pub fn write(&self, bytes: &mut [u8]) {
        write_u24(&mut bytes[0..3], self.capacity);
        bytes[3] = 0;
        let mut flags = 0u8;
        if self.is_inner_bptree {
            flags |= HeaderFlags::INNER_BPTREE.0;
        }
        if self.has_refs {
            flags |= HeaderFlags::HAS_REFS.0;
        }
        if self.context_flag {
            flags |= HeaderFlags::CONTEXT.0;
        }
        flags |= (self.width_type as u8) << 3;
        flags |= width_index(self.width);
        bytes[4] = flags;
        write_u24(&mut bytes[5..8], self.size);
    }

    /// Offset of the payload within the node.
    #[inline]
    #[must_use]
    pub fn byte_offset(&self) -> usize {
        NODE_HEADER_SIZE
    }

    /// Payload length in bytes for the current size and width.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        payload_len(self.width_type, self.size, self.width)
    }
}

/// Payload bytes needed for `size` elements.
#[must_use]
pub fn payload_len(width_type: WidthType, size: usize, width: u8) -> usize {
    match width_type {
        WidthType::Bits => (size * width as usize + 7) / 8,
        WidthType::Multiply => size * width as usize,
        WidthType::Ignore => size,
    }
}

/// Node bytes needed for `size` elements, rounded up to 8.
#[must_use]
pub fn node_len(width_type: WidthType, size: usize, width: u8) -> usize {
    (NODE_HEADER_SIZE + payload_len(width_type, size, width) + 7) & !7
}

fn width_index(width: u8) -> u8 {
    match width {
        0 => 0,
        1 => 1,
        2 => 2,
        4 => 3,
        8 => 4,
        16 => 5,
        32 => 6,
        _ => 7,
    }
}

#[inline]
fn read_u24(b: &[u8]) -> usize {
    b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16
}

#[inline]
fn write_u24(b: &mut [u8], v: usize) {
    b[0] = v as u8;
    b[1] = (v >> 8) as u8;
    b[2] = (v >> 16) as u8;
}

/// Reads the capacity field without decoding the rest of the header.
#[inline]
pub fn read_capacity(bytes: &[u8]) -> usize {
    read_u24(&bytes[0..3])
}

/// Updates the capacity field.
#[inline]
pub fn set_capacity(bytes: &mut [u8], capacity: usize) {
    write_u24(&mut bytes[0..3], capacity);
}

/// Updates the size field.
#[inline]
pub fn set_size(bytes: &mut [u8], size: usize) {
    write_u24(&mut bytes[5..8], size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = NodeHeader {
            capacity: 0x01_02_03,
            is_inner_bptree: true,
            has_refs: true,
            context_flag: false,
            width_type: WidthType::Bits,
            width: 16,
            size: 0x0A_0B_0C,
        };
        let mut bytes = [0u8; 8];
        header.write(&mut bytes);
        assert_eq!(bytes, [0x03, 0x02, 0x01, 0, 0b1100_0101, 0x0C, 0x0B, 0x0A]);
        assert_eq!(NodeHeader::parse(&bytes), Some(header));
    }

    #[test]
    fn test_blob_header() {
        let header = NodeHeader::blob(24, 13);
        let mut bytes = [0u8; 8];
        header.write(&mut bytes);
        let parsed = NodeHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.width_type, WidthType::Ignore);
        assert_eq!(parsed.payload_len(), 13);
        assert_eq!(node_len(WidthType::Ignore, 13, 0), 24);
    }

    #[test]
    fn test_payload_len() {
        assert_eq!(payload_len(WidthType::Bits, 9, 1), 2);
        assert_eq!(payload_len(WidthType::Bits, 3, 64), 24);
        assert_eq!(payload_len(WidthType::Bits, 100, 0), 0);
        assert_eq!(node_len(WidthType::Bits, 0, 0), 8);
    }
}
