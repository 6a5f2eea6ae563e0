//! Width-specialized element access.
//!
//! Widths 0 through 4 hold unsigned values; widths 8 and up hold signed
//! two's complement values. Sub-byte widths pack elements little-endian
//! within each byte.

/// Reads element `ndx` from a payload.
pub type Getter = fn(&[u8], usize) -> i64;

/// Writes element `ndx` into a payload.
pub type Setter = fn(&mut [u8], usize, i64);

fn get_0(_: &[u8], _: usize) -> i64 {
    0
}

fn get_1(data: &[u8], ndx: usize) -> i64 {
    ((data[ndx >> 3] >> (ndx & 7)) & 0x1) as i64
}

fn get_2(data: &[u8], ndx: usize) -> i64 {
    ((data[ndx >> 2] >> ((ndx & 3) << 1)) & 0x3) as i64
}

fn get_4(data: &[u8], ndx: usize) -> i64 {
    ((data[ndx >> 1] >> ((ndx & 1) << 2)) & 0xF) as i64
}

fn get_8(data: &[u8], ndx: usize) -> i64 {
    data[ndx] as i8 as i64
}

fn get_16(data: &[u8], ndx: usize) -> i64 {
    let p = ndx * 2;
    i16::from_le_bytes([data[p], data[p + 1]]) as i64
}

fn get_32(data: &[u8], ndx: usize) -> i64 {
    let p = ndx * 4;
    i32::from_le_bytes([data[p], data[p + 1], data[p + 2], data[p + 3]]) as i64
}

fn get_64(data: &[u8], ndx: usize) -> i64 {
    let p = ndx * 8;
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[p..p + 8]);
    i64::from_le_bytes(b)
}

fn set_0(_: &mut [u8], _: usize, _: i64) {}

fn set_1(data: &mut [u8], ndx: usize, v: i64) {
    let shift = ndx & 7;
    let byte = &mut data[ndx >> 3];
    *byte = (*byte & !(0x1 << shift)) | (((v as u8) & 0x1) << shift);
}

fn set_2(data: &mut [u8], ndx: usize, v: i64) {
    let shift = (ndx & 3) << 1;
    let byte = &mut data[ndx >> 2];
    *byte = (*byte & !(0x3 << shift)) | (((v as u8) & 0x3) << shift);
}

fn set_4(data: &mut [u8], ndx: usize, v: i64) {
    let shift = (ndx & 1) << 2;
    let byte = &mut data[ndx >> 1];
    *byte = (*byte & !(0xF << shift)) | (((v as u8) & 0xF) << shift);
}

fn set_8(data: &mut [u8], ndx: usize, v: i64) {
    data[ndx] = v as i8 as u8;
}

fn set_16(data: &mut [u8], ndx: usize, v: i64) {
    let p = ndx * 2;
    data[p..p + 2].copy_from_slice(&(v as i16).to_le_bytes());
}

fn set_32(data: &mut [u8], ndx: usize, v: i64) {
    let p = ndx * 4;
    data[p..p + 4].copy_from_slice(&(v as i32).to_le_bytes());
}

fn set_64(data: &mut [u8], ndx: usize, v: i64) {
    let p = ndx * 8;
    data[p..p + 8].copy_from_slice(&v.to_le_bytes());
}

/// Selects the getter for a width.
#[must_use]
pub fn getter_for_width(width: u8) -> Getter {
    match width {
        0 => get_0,
        1 => get_1,
        2 => get_2,
        4 => get_4,
        8 => get_8,
        16 => get_16,
        32 => get_32,
        _ => get_64,
    }
}

/// Selects the setter for a width.
#[must_use]
pub fn setter_for_width(width: u8) -> Setter {
    match width {
        0 => set_0,
        1 => set_1,
        2 => set_2,
        4 => set_4,
        8 => set_8,
        16 => set_16,
        32 => set_32,
        _ => set_64,
    }
}

/// Smallest value representable at `width`.
#[must_use]
pub const fn lbound_for_width(width: u8) -> i64 {
    match width {
        0..=4 => 0,
        8 => i8::MIN as i64,
        16 => i16::MIN as i64,
        32 => i32::MIN as i64,
        _ => i64::MIN,
    }
}

/// Largest value representable at `width`.
#[must_use]
pub const fn ubound_for_width(width: u8) -> i64 {
    match width {
        0 => 0,
        1 => 1,
        2 => 3,
        4 => 15,
        8 => i8::MAX as i64,
        16 => i16::MAX as i64,
        32 => i32::MAX as i64,
        _ => i64::MAX,
    }
}

/// Smallest width that can represent `v`.
#[must_use]
pub fn bit_width(v: i64) -> u8 {
    if (0..=15).contains(&v) {
        return match v {
            0 => 0,
            1 => 1,
            2..=3 => 2,
            _ => 4,
        };
    }
    if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
        8
    } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
        16
    } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        32
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_width_bounds() {
        for w in [0u8, 1, 2, 4, 8, 16, 32, 64] {
            assert_eq!(bit_width(lbound_for_width(w)).max(w), w);
            assert!(bit_width(ubound_for_width(w)) <= w);
        }
        assert_eq!(bit_width(-1), 8);
        assert_eq!(bit_width(16), 8);
        assert_eq!(bit_width(128), 16);
        assert_eq!(bit_width(i64::MIN), 64);
    }

    #[test]
    fn test_packed_get_set() {
        for w in [1u8, 2, 4, 8, 16, 32, 64] {
            let mut data = vec![0u8; 64];
            let set = setter_for_width(w);
            let get = getter_for_width(w);
            let hi = ubound_for_width(w);
            let lo = lbound_for_width(w);
            for i in 0..7 {
                let v = if i % 2 == 0 { hi } else { lo };
                set(&mut data, i, v);
            }
            for i in 0..7 {
                let v = if i % 2 == 0 { hi } else { lo };
                assert_eq!(get(&data, i), v, "width {} index {}", w, i);
            }
        }
    }
}
