use crate::error::Error;

macro_rules! impl_unsigned {
    ($type:ty, $size:literal, $load_name:ident, $store_name:ident) => {
        #[inline(always)]
        pub fn $load_name(&self, ptr: u32, offset: u32) -> Result<$type, Error> {
            let addr = (ptr as usize) + (offset as usize);
            let raw = self.data.get(addr..addr + $size).ok_or(Error::OutOfBounds)?;
            let mut buf = [0u8; $size];
            buf.copy_from_slice(raw);
            Ok(<$type>::from_le_bytes(buf))
        }
        #[inline(always)]
        pub fn $store_name(&mut self, ptr: u32, offset: u32, v: $type) -> Result<(), Error> {
            let addr = (ptr as usize) + (offset as usize);
            let dst = self.data.get_mut(addr..addr + $size).ok_or(Error::OutOfBounds)?;
            dst.copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
    };
}

macro_rules! impl_signed_load {
    ($name:ident, $target:ty, $source:ident) => {
        #[inline(always)]
        pub fn $name(&self, ptr: u32, offset: u32) -> Result<$target, Error> {
            Ok(self.$source(ptr, offset)? as $target)
        }
    };
}

/// Sandboxed linear memory of one contract instance.
///
/// All accesses are bounds-checked against the current size; there is no
/// way to obtain a reference that outlives a single host-call access.
pub struct WasmMemory {
    data: Vec<u8>,
    current: u32,
    maximum: u32,
}

impl WasmMemory {
    pub const MAX_PAGES: u32 = 65536;
    pub const PAGE_SIZE: u32 = 65536;

    pub fn new(initial: u32, maximum: u32) -> Self {
        let maximum = maximum.min(Self::MAX_PAGES);
        let data = vec![0; (initial as usize) * (Self::PAGE_SIZE as usize)];
        Self { data, current: initial, maximum }
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 { self.current }
    pub fn max(&self) -> u32 { self.maximum }
    pub fn byte_len(&self) -> usize { self.data.len() }

    /// Grows by `delta` pages, returning the previous size in pages.
    pub fn grow(&mut self, delta: u32) -> Result<u32, Error> {
        if delta == 0 { return Ok(self.current); }
        if delta > self.maximum.saturating_sub(self.current) { return Err(Error::MemoryLimitExceeded); }
        let old = self.current;
        self.current += delta;
        self.data.resize((self.current as usize) * (Self::PAGE_SIZE as usize), 0);
        Ok(old)
    }

    /// Copies `length` bytes starting at `offset` out of the sandbox.
    pub fn read(&self, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        if length == 0 { return Ok(Vec::new()); }
        let start = offset as usize;
        let end = start.checked_add(length as usize).ok_or(Error::OutOfBounds)?;
        self.data.get(start..end).map(<[u8]>::to_vec).ok_or(Error::OutOfBounds)
    }

    /// Copies `bytes` into the sandbox at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() { return Ok(()); }
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(Error::OutOfBounds)?;
        self.data.get_mut(start..end).ok_or(Error::OutOfBounds)?.copy_from_slice(bytes);
        Ok(())
    }

    impl_unsigned!(u8,  1, load_u8, store_u8);    impl_unsigned!(u16, 2, load_u16, store_u16);
    impl_unsigned!(u32, 4, load_u32, store_u32);  impl_unsigned!(u64, 8, load_u64, store_u64);
    impl_signed_load!(load_i8,  i8,  load_u8);    impl_signed_load!(load_i16, i16, load_u16);
    impl_signed_load!(load_i32, i32, load_u32);

    #[inline(always)]
    pub fn load_f32(&self, ptr: u32, offset: u32) -> Result<f32, Error> {
        Ok(f32::from_bits(self.load_u32(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f32(&mut self, ptr: u32, offset: u32, v: f32) -> Result<(), Error> {
        self.store_u32(ptr, offset, v.to_bits())
    }
    #[inline(always)]
    pub fn load_f64(&self, ptr: u32, offset: u32) -> Result<f64, Error> {
        Ok(f64::from_bits(self.load_u64(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f64(&mut self, ptr: u32, offset: u32, v: f64) -> Result<(), Error> {
        self.store_u64(ptr, offset, v.to_bits())
    }
}
