use crate::error::*;

#[derive(Clone, Copy)]
pub struct ByteIter<'a> {
    pub bytes: &'a [u8],
    pub idx: usize,
}

impl<'a> ByteIter<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8], idx: usize) -> Self { Self { bytes, idx } }
    #[inline]
    pub fn empty(&self) -> bool { self.idx >= self.bytes.len() }
    #[inline]
    pub fn has_n_left(&self, n: usize) -> bool { self.idx.saturating_add(n) <= self.bytes.len() }
    #[inline]
    pub fn cur(&self) -> usize { self.idx }
    #[inline]
    pub fn advance(&mut self, n: usize) { self.idx += n; }
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.bytes.get(self.idx).ok_or(Error::malformed(UNEXPECTED_END))?;
        self.idx += 1;
        Ok(b)
    }
    #[inline]
    pub fn peek_u8(&self) -> Result<u8, Error> {
        self.bytes.get(self.idx).copied().ok_or(Error::malformed(UNEXPECTED_END))
    }
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        crate::leb128::safe_read_leb128(self.bytes, &mut self.idx, 32)
    }
    /// Reads a length-prefixed byte vector and advances past it.
    #[inline]
    pub fn read_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        let slice = self.slice_from(self.idx, len)?;
        self.idx += len;
        Ok(slice)
    }
    /// Reads a length-prefixed UTF-8 name.
    pub fn read_name(&mut self) -> Result<String, Error> {
        let raw = self.read_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| Error::malformed(INVALID_UTF8))
    }
    #[inline]
    pub fn slice_from(&self, start: usize, len: usize) -> Result<&'a [u8], Error> {
        let end = start.checked_add(len).ok_or(Error::malformed(UNEXPECTED_END_SHORT))?;
        if end > self.bytes.len() { return Err(Error::malformed(UNEXPECTED_END_SHORT)); }
        Ok(&self.bytes[start..end])
    }
}
