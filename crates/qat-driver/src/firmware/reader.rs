//! Bounds-checked little-endian cursor over firmware bytes

use crate::error::{QatError, Result};
use std::ops::Range;

/// Cursor over a byte slice. Every read is checked against the end of the
/// slice; running off the end is `MalformedFirmware`.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Cursor at the start of `buf`.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor at `offset` within `buf`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if `offset` lies past the end.
    pub fn at(buf: &'a [u8], offset: usize) -> Result<Self> {
        if offset > buf.len() {
            return Err(QatError::malformed(format!(
                "offset {offset:#x} past end of {:#x}-byte region",
                buf.len()
            )));
        }
        Ok(Self { buf, pos: offset })
    }

    /// Current position.
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than `n` bytes remain.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                QatError::malformed(format!(
                    "read of {n:#x} bytes at {:#x} past end of {:#x}-byte region",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Skip `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Fixed-size array.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than `N` bytes remain.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// One byte.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` at end of region.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than 2 bytes remain.
    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than 4 bytes remain.
    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    /// Little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if fewer than 8 bytes remain.
    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns the record's parse error.
    pub fn read<T: FromReader>(&mut self) -> Result<T> {
        T::read(self)
    }
}

/// Fixed-size little-endian record.
pub trait FromReader: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode one record at the cursor.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFirmware` if the record is truncated or invalid.
    fn read(r: &mut Reader<'_>) -> Result<Self>;
}

/// Byte range `offset..offset + size`, checked against a parent of
/// `parent_len` bytes.
///
/// # Errors
///
/// Returns `MalformedFirmware` naming `what` if the range overflows or
/// leaves the parent.
pub fn checked_range(parent_len: usize, offset: u64, size: u64, what: &str) -> Result<Range<usize>> {
    let bad = || {
        QatError::malformed(format!(
            "{what}: {offset:#x}+{size:#x} exceeds parent of {parent_len:#x} bytes"
        ))
    };
    let start = usize::try_from(offset).map_err(|_| bad())?;
    let size = usize::try_from(size).map_err(|_| bad())?;
    let end = start.checked_add(size).ok_or_else(bad)?;
    if end > parent_len {
        return Err(bad());
    }
    Ok(start..end)
}

/// Read a `[u32 count][count × T]` table starting at `offset` of `region`.
///
/// # Errors
///
/// Returns `MalformedFirmware` if the count or any entry lies outside
/// `region`.
pub fn read_table<T: FromReader>(region: &[u8], offset: usize) -> Result<Vec<T>> {
    let mut r = Reader::at(region, offset)?;
    let count = r.u32()? as usize;
    let needed = count.checked_mul(T::SIZE).filter(|&n| n <= r.remaining());
    if needed.is_none() {
        return Err(QatError::malformed(format!(
            "table at {offset:#x}: {count} entries of {} bytes exceed region",
            T::SIZE
        )));
    }
    (0..count).map(|_| r.read()).collect()
}

/// NUL-terminated string starting at `offset` of a string table.
///
/// # Errors
///
/// Returns `MalformedFirmware` if the offset is outside the table, no
/// terminator follows, or the bytes are not UTF-8.
pub fn cstr_at(strings: &[u8], offset: usize) -> Result<&str> {
    let tail = strings.get(offset..).ok_or_else(|| {
        QatError::malformed(format!("string offset {offset:#x} outside table of {:#x} bytes", strings.len()))
    })?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| QatError::malformed(format!("unterminated string at {offset:#x}")))?;
    std::str::from_utf8(&tail[..len])
        .map_err(|e| QatError::malformed(format!("string at {offset:#x}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair(u16, u32);

    impl FromReader for Pair {
        const SIZE: usize = 6;
        fn read(r: &mut Reader<'_>) -> Result<Self> {
            Ok(Self(r.u16()?, r.u32()?))
        }
    }

    #[test]
    fn scalars_are_little_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut r = Reader::new(&buf);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x0302);
        assert_eq!(r.u32().unwrap(), 0x0706_0504);
        assert_eq!(r.remaining(), 0);
        assert!(matches!(r.u8().unwrap_err(), QatError::MalformedFirmware { .. }));
    }

    #[test]
    fn tables_are_bounds_checked() {
        let mut buf = vec![0xaa];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[1, 0, 2, 0, 0, 0, 3, 0, 4, 0, 0, 0]);
        let t: Vec<Pair> = read_table(&buf, 1).unwrap();
        assert_eq!(t, vec![Pair(1, 2), Pair(3, 4)]);

        buf.truncate(buf.len() - 1);
        assert!(read_table::<Pair>(&buf, 1).is_err());
        assert!(read_table::<Pair>(&buf, 100).is_err());
    }

    #[test]
    fn huge_counts_do_not_overflow() {
        let buf = u32::MAX.to_le_bytes();
        assert!(read_table::<Pair>(&buf, 0).is_err());
    }

    #[test]
    fn ranges_reject_overflow() {
        assert_eq!(checked_range(16, 4, 12, "x").unwrap(), 4..16);
        assert!(checked_range(16, 4, 13, "x").is_err());
        assert!(checked_range(16, u64::MAX, 2, "x").is_err());
    }

    #[test]
    fn strings_need_terminator() {
        let t = b"one\0two\0three";
        assert_eq!(cstr_at(t, 0).unwrap(), "one");
        assert_eq!(cstr_at(t, 4).unwrap(), "two");
        assert!(cstr_at(t, 8).is_err());
        assert!(cstr_at(t, 40).is_err());
    }
}
