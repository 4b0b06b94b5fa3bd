use std::io::{Read, Seek, SeekFrom, Write};

// Binary helpers for node state that is persisted with a model
//
// Everything is little-endian and fixed width. Callers that read a value
// they then reject can rewind the cursor to just before it with
// `rewind_u32`, so the next reader sees the stream untouched.

/// Width in bytes of one persisted u32.
pub const U32_WIDTH: i64 = 4;

pub fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Step back over the u32 that was just read.
pub fn rewind_u32(r: &mut impl Seek) -> std::io::Result<u64> {
    r.seek(SeekFrom::Current(-U32_WIDTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_u32_is_little_endian() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, vec![4, 3, 2, 1]);
        assert_eq!(read_u32(&mut Cursor::new(buf)).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_rewind_returns_to_value_start() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 7).unwrap();
        write_u32(&mut buf, 9).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_u32(&mut cur).unwrap(), 7);
        assert_eq!(read_u32(&mut cur).unwrap(), 9);
        assert_eq!(rewind_u32(&mut cur).unwrap(), 4);
        assert_eq!(read_u32(&mut cur).unwrap(), 9);
    }

    #[test]
    fn test_short_read_is_error() {
        let mut cur = Cursor::new(vec![1u8, 2]);
        assert!(read_u32(&mut cur).is_err());
    }
}
