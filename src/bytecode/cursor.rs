/// Checked little-endian reader over serialized function code.
///
/// Every read that would run past the end of the buffer fails with
/// [`OutOfBounds`] instead of touching memory it doesn't own.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("read of {width} bytes at offset {offset} runs past the end of {len}-byte code")]
pub struct OutOfBounds {
    pub offset: usize,
    pub width: usize,
    pub len: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Cursor { code, pos: 0 }
    }

    pub fn at(code: &'a [u8], pos: usize) -> Self {
        Cursor { code, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    /// Moves to an absolute offset. The offset must start an instruction
    /// inside the buffer.
    pub fn seek(&mut self, pos: usize) -> Result<(), OutOfBounds> {
        if pos >= self.code.len() {
            return Err(OutOfBounds { offset: pos, width: 1, len: self.code.len() });
        }
        self.pos = pos;
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], OutOfBounds> {
        let end = self.pos.checked_add(N);
        let bytes = end
            .and_then(|end| self.code.get(self.pos..end))
            .ok_or(OutOfBounds { offset: self.pos, width: N, len: self.code.len() })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos += N;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, OutOfBounds> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, OutOfBounds> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, OutOfBounds> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    /// Reads a u32 and widens it for use as an index.
    pub fn read_index(&mut self) -> Result<usize, OutOfBounds> {
        self.read_u32().map(|v| v as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian() {
        let code = [0x78, 0x56, 0x34, 0x12, 0xff, 1, 0, 0, 0, 0, 0, 0, 0x80];
        let mut c = Cursor::new(&code);
        assert_eq!(c.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(c.read_u8().unwrap(), 0xff);
        assert_eq!(c.read_u64().unwrap(), 0x8000_0000_0000_0001);
        assert!(c.is_at_end());
    }

    #[test]
    fn short_read_fails_without_advancing() {
        let code = [1, 2, 3];
        let mut c = Cursor::new(&code);
        let err = c.read_u32().unwrap_err();
        assert_eq!(err, OutOfBounds { offset: 0, width: 4, len: 3 });
        assert_eq!(c.pos(), 0);
        assert_eq!(c.read_u8().unwrap(), 1);
    }

    #[test]
    fn seek_rejects_end_of_code() {
        let code = [0u8; 8];
        let mut c = Cursor::new(&code);
        assert!(c.seek(7).is_ok());
        assert_eq!(c.pos(), 7);
        assert!(c.seek(8).is_err());
        assert!(c.seek(usize::MAX).is_err());
    }

    #[test]
    fn read_at_huge_offset_does_not_overflow() {
        let code = [0u8; 4];
        let mut c = Cursor::at(&code, usize::MAX - 1);
        assert!(c.read_u64().is_err());
    }
}
