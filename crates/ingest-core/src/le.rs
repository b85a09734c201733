//! Bounds-checked little-endian field readers for fixed-offset packets.
//!
//! Every reader returns `None` instead of panicking when the field lies
//! past the end of the buffer.

use byteorder::{ByteOrder, LittleEndian};

pub fn read_i32_le(data: &[u8], offset: usize) -> Option<i32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_i32)
}

pub fn read_f32_le(data: &[u8], offset: usize) -> Option<f32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_bounds() {
        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&(-7i32).to_le_bytes());
        buf[4..8].copy_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(read_i32_le(&buf, 0), Some(-7));
        assert_eq!(read_f32_le(&buf, 4), Some(1.5));
    }

    #[test]
    fn out_of_bounds_is_none() {
        let buf = [0u8; 6];
        assert_eq!(read_i32_le(&buf, 3), None);
        assert_eq!(read_f32_le(&buf, 308), None);
        assert_eq!(read_f32_le(&buf, 2), Some(f32::from_le_bytes([0; 4])));
        assert_eq!(read_i32_le(&buf, usize::MAX - 1), None);
    }
}
