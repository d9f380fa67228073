//! Bounds-checked little-endian reader over an executable image.
//!
//! The reader exposes a window `[start, start + size)` of an underlying seekable source and refuses
//! any read or seek that would leave it, so a truncated or hostile image surfaces as
//! [`ImageError::ImageTooSmall`] instead of a short read.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::common::ImageError;

pub struct ImageReader<R> {
    inner: R,
    start: u64,
    size: u64,
    position: u64,
}

impl<'a> ImageReader<Cursor<&'a [u8]>> {
    /// Reader spanning a whole in-memory buffer
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, ImageError> {
        Self::new(Cursor::new(data), 0)
    }
}

impl<R: Read + Seek> ImageReader<R> {
    /// Window starting at the source's current position.
    /// A `size` of 0 extends the window to the end of the source.
    pub fn new(mut inner: R, size: u64) -> Result<Self, ImageError> {
        let start = inner.stream_position()?;
        let end = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(start))?;

        let remaining = end.saturating_sub(start);
        if size > remaining {
            return Err(ImageError::ImageTooSmall);
        }
        let size = if size == 0 { remaining } else { size };

        Ok(Self {
            inner,
            start,
            size,
            position: start,
        })
    }

    /// Length of the window
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current position, relative to the start of the window
    pub fn offset(&self) -> u64 {
        self.position - self.start
    }

    /// Move to `offset` bytes past the start of the window
    pub fn seek(&mut self, offset: u64) -> Result<(), ImageError> {
        if offset >= self.size {
            return Err(ImageError::ImageTooSmall);
        }
        self.position = self.start + offset;
        self.inner.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    pub fn skip(&mut self, count: u64) -> Result<(), ImageError> {
        self.check(count)?;
        self.position += count;
        self.inner.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    fn check(&self, width: u64) -> Result<(), ImageError> {
        match self.position.checked_add(width) {
            Some(end) if end <= self.start + self.size => Ok(()),
            _ => Err(ImageError::ImageTooSmall),
        }
    }

    fn advance<T>(&mut self, width: u64, value: std::io::Result<T>) -> Result<T, ImageError> {
        let value = value?;
        self.position += width;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, ImageError> {
        self.check(1)?;
        let v = self.inner.read_u8();
        self.advance(1, v)
    }

    pub fn read_u16(&mut self) -> Result<u16, ImageError> {
        self.check(2)?;
        let v = self.inner.read_u16::<LittleEndian>();
        self.advance(2, v)
    }

    pub fn read_u32(&mut self) -> Result<u32, ImageError> {
        self.check(4)?;
        let v = self.inner.read_u32::<LittleEndian>();
        self.advance(4, v)
    }

    pub fn read_u64(&mut self) -> Result<u64, ImageError> {
        self.check(8)?;
        let v = self.inner.read_u64::<LittleEndian>();
        self.advance(8, v)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, ImageError> {
        self.check(count as u64)?;
        let mut buf = vec![0u8; count];
        let r = self.inner.read_exact(&mut buf);
        self.advance(count as u64, r)?;
        Ok(buf)
    }

    /// Fixed-width field padded with trailing NULs, decoded as UTF-8
    pub fn read_null_padded_utf8(&mut self, count: usize) -> Result<String, ImageError> {
        let bytes = self.read_bytes(count)?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    /// NUL-terminated string; fails if the terminator lies outside the window
    pub fn read_c_string(&mut self) -> Result<String, ImageError> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_values() -> Result<(), ImageError> {
        let data = [0x4d, 0x5a, 0x78, 0x56, 0x34, 0x12, 1, 0, 0, 0, 0, 0, 0, 0];
        let mut r = ImageReader::from_bytes(&data)?;
        assert_eq!(r.read_u16()?, 0x5a4d);
        assert_eq!(r.read_u32()?, 0x1234_5678);
        assert_eq!(r.read_u64()?, 1);
        assert_eq!(r.offset(), 14);
        Ok(())
    }

    #[test]
    fn read_past_end_is_image_too_small() -> Result<(), ImageError> {
        let data = [1u8, 2, 3];
        let mut r = ImageReader::from_bytes(&data)?;
        assert!(matches!(r.read_u32(), Err(ImageError::ImageTooSmall)));
        // a failed read does not consume anything
        assert_eq!(r.offset(), 0);
        assert_eq!(r.read_u16()?, 0x0201);
        Ok(())
    }

    #[test]
    fn window_is_relative_to_start() -> Result<(), ImageError> {
        let data = [0xffu8, 0xff, 0x10, 0x20, 0x30, 0x40];
        let mut cursor = Cursor::new(&data[..]);
        cursor.set_position(2);
        let mut r = ImageReader::new(cursor, 3)?;
        assert_eq!(r.size(), 3);
        assert_eq!(r.read_u16()?, 0x2010);
        assert!(matches!(r.read_u16(), Err(ImageError::ImageTooSmall)));
        r.seek(2)?;
        assert_eq!(r.read_u8()?, 0x30);
        assert!(matches!(r.seek(3), Err(ImageError::ImageTooSmall)));
        Ok(())
    }

    #[test]
    fn oversized_window_is_rejected() {
        let data = [0u8; 4];
        assert!(matches!(
            ImageReader::new(Cursor::new(&data[..]), 5),
            Err(ImageError::ImageTooSmall)
        ));
    }

    #[test]
    fn strings() -> Result<(), ImageError> {
        let data = b".text\0\0\0KERNEL32.dll\0";
        let mut r = ImageReader::from_bytes(data)?;
        assert_eq!(r.read_null_padded_utf8(8)?, ".text");
        assert_eq!(r.read_c_string()?, "KERNEL32.dll");

        let unterminated = b"abc";
        let mut r = ImageReader::from_bytes(unterminated)?;
        assert!(matches!(r.read_c_string(), Err(ImageError::ImageTooSmall)));
        Ok(())
    }
}
