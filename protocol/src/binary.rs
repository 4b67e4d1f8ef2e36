//! Offset-explicit binary primitives.
//!
//! Writers take a growable buffer and an absolute offset, grow the buffer when
//! the write would run past its end, and return the number of bytes written.
//! There is no implicit cursor: callers keep their own offsets so that length
//! prefixes written earlier can be patched once the content after them is
//! known. All integers are little-endian.
//!
//! Readers take a plain slice and fail with [`CodecError::Truncated`] instead
//! of reading out of range.

use crate::error::{CodecError, Result};

/// Length prefix marking a null string or byte block.
pub const NULL_LENGTH: i32 = -1;

fn reserve(buf: &mut Vec<u8>, offset: usize, len: usize) {
    let end = offset + len;
    if buf.len() < end {
        buf.resize(end, 0);
    }
}

fn slice(bytes: &[u8], offset: usize, needed: usize) -> Result<&[u8]> {
    match offset.checked_add(needed) {
        Some(end) if end <= bytes.len() => Ok(&bytes[offset..end]),
        _ => Err(CodecError::Truncated {
            offset,
            needed,
            available: bytes.len().saturating_sub(offset),
        }),
    }
}

macro_rules! fixed_width {
    ($write:ident, $read:ident, $ty:ty) => {
        pub fn $write(buf: &mut Vec<u8>, offset: usize, value: $ty) -> usize {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            reserve(buf, offset, WIDTH);
            buf[offset..offset + WIDTH].copy_from_slice(&value.to_le_bytes());
            WIDTH
        }

        pub fn $read(bytes: &[u8], offset: usize) -> Result<$ty> {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let raw = slice(bytes, offset, WIDTH)?;
            let mut array = [0u8; WIDTH];
            array.copy_from_slice(raw);
            Ok(<$ty>::from_le_bytes(array))
        }
    };
}

fixed_width!(write_u8, read_u8, u8);
fixed_width!(write_i32, read_i32, i32);
fixed_width!(write_u32, read_u32, u32);
fixed_width!(write_i64, read_i64, i64);
fixed_width!(write_u64, read_u64, u64);

/// Copies `data` verbatim to `offset`.
pub fn write_raw(buf: &mut Vec<u8>, offset: usize, data: &[u8]) -> usize {
    reserve(buf, offset, data.len());
    buf[offset..offset + data.len()].copy_from_slice(data);
    data.len()
}

/// Borrows `len` bytes starting at `offset`.
pub fn read_raw(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    slice(bytes, offset, len)
}

/// Writes a length-prefixed byte block, `None` as the `-1` sentinel.
pub fn write_bytes(buf: &mut Vec<u8>, offset: usize, value: Option<&[u8]>) -> Result<usize> {
    match value {
        None => Ok(write_i32(buf, offset, NULL_LENGTH)),
        Some(data) => {
            let length = i32::try_from(data.len()).map_err(|_| CodecError::TooLarge(data.len()))?;
            let prefix = write_i32(buf, offset, length);
            Ok(prefix + write_raw(buf, offset + prefix, data))
        }
    }
}

/// Reads a length-prefixed byte block and the number of bytes it occupied.
pub fn read_bytes(bytes: &[u8], offset: usize) -> Result<(Option<&[u8]>, usize)> {
    let length = read_i32(bytes, offset)?;
    if length == NULL_LENGTH {
        return Ok((None, 4));
    }
    if length < 0 {
        return Err(CodecError::InvalidLength { offset, length });
    }
    let data = slice(bytes, offset + 4, length as usize)?;
    Ok((Some(data), 4 + length as usize))
}

pub fn write_string(buf: &mut Vec<u8>, offset: usize, value: Option<&str>) -> Result<usize> {
    write_bytes(buf, offset, value.map(str::as_bytes))
}

pub fn read_string(bytes: &[u8], offset: usize) -> Result<(Option<String>, usize)> {
    let (data, consumed) = read_bytes(bytes, offset)?;
    match data {
        None => Ok((None, consumed)),
        Some(data) => {
            let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8 { offset })?;
            Ok((Some(text.to_owned()), consumed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_grows_buffer() {
        let mut buf = Vec::new();
        assert_eq!(write_u64(&mut buf, 4, 0x0102_0304_0506_0708), 8);
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        assert_eq!(buf[4], 0x08);
        assert_eq!(read_u64(&buf, 4).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_backpatch_earlier_field() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 0, 0);
        let written = write_string(&mut buf, 4, Some("lobby")).unwrap();
        write_i32(&mut buf, 0, (4 + written) as i32);

        assert_eq!(buf.len(), 13);
        assert_eq!(read_i32(&buf, 0).unwrap(), 13);
    }

    #[test]
    fn test_signed_values() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 0, -42);
        write_i64(&mut buf, 4, i64::MIN);
        assert_eq!(read_i32(&buf, 0).unwrap(), -42);
        assert_eq!(read_i64(&buf, 4).unwrap(), i64::MIN);
    }

    #[test]
    fn test_null_string_sentinel() {
        let mut buf = Vec::new();
        assert_eq!(write_string(&mut buf, 0, None).unwrap(), 4);
        assert_eq!(buf, (-1i32).to_le_bytes());
        assert_eq!(read_string(&buf, 0).unwrap(), (None, 4));
    }

    #[test]
    fn test_empty_and_unicode_strings() {
        let mut buf = Vec::new();
        let first = write_string(&mut buf, 0, Some("")).unwrap();
        write_string(&mut buf, first, Some("Überkarte")).unwrap();

        assert_eq!(read_string(&buf, 0).unwrap(), (Some(String::new()), 4));
        let (text, consumed) = read_string(&buf, first).unwrap();
        assert_eq!(text.as_deref(), Some("Überkarte"));
        assert_eq!(consumed, 4 + "Überkarte".len());
    }

    #[test]
    fn test_byte_block() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, 0, Some(&[9, 8, 7])).unwrap();
        let (data, consumed) = read_bytes(&buf, 0).unwrap();
        assert_eq!(data, Some(&[9u8, 8, 7][..]));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_truncated_reads_fail() {
        let buf = [1u8, 2, 3];
        assert_eq!(
            read_i32(&buf, 0),
            Err(CodecError::Truncated {
                offset: 0,
                needed: 4,
                available: 3
            })
        );
        assert!(read_u8(&buf, 3).is_err());
        assert!(read_u64(&buf, usize::MAX).is_err());
    }

    #[test]
    fn test_length_prefix_past_end() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 0, 100);
        buf.extend_from_slice(b"short");
        assert!(matches!(read_bytes(&buf, 0), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 0, -7);
        assert_eq!(
            read_bytes(&buf, 0),
            Err(CodecError::InvalidLength {
                offset: 0,
                length: -7
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, 0, Some(&[0xff, 0xfe])).unwrap();
        assert_eq!(read_string(&buf, 0), Err(CodecError::InvalidUtf8 { offset: 0 }));
    }
}
