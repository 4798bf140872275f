//! LEB128 unsigned varints used by the scene bundle.

use crate::error::SplatError;

const MAX_VARINT_BYTES: usize = 10;

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads one varint at `*offset`, advancing it. Values that need more than
/// 64 bits are rejected instead of wrapping.
pub fn read_varint(data: &[u8], offset: &mut usize) -> Result<u64, SplatError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_BYTES {
        let byte = *data
            .get(*offset)
            .ok_or_else(|| SplatError::InvalidBundle("Truncated varint".to_string()))?;
        *offset += 1;

        let bits = (byte & 0x7F) as u64;
        let shift = 7 * i as u32;
        // The tenth byte may only carry the single remaining bit.
        if i == MAX_VARINT_BYTES - 1 && bits > 1 {
            return Err(SplatError::VarintOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(SplatError::VarintOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_varint(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, [0xAC, 0x02]);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut offset = 0;
        let too_long = [0xFFu8; 11];
        assert!(matches!(
            read_varint(&too_long, &mut offset),
            Err(SplatError::VarintOverflow)
        ));

        // Ten bytes whose last one carries more than one bit.
        let mut wide = vec![0xFFu8; 9];
        wide.push(0x02);
        let mut offset = 0;
        assert!(matches!(
            read_varint(&wide, &mut offset),
            Err(SplatError::VarintOverflow)
        ));
    }

    #[test]
    fn test_truncated() {
        let mut offset = 0;
        assert!(matches!(
            read_varint(&[0x80, 0x80], &mut offset),
            Err(SplatError::InvalidBundle(_))
        ));
    }
}
