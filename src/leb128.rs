use crate::error::*;

/// Decodes an unsigned LEB128 integer of at most `bits` bits, rejecting
/// overlong encodings and set bits beyond the declared width.
#[inline]
pub fn safe_read_leb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    let mut byte: u8;
    loop {
        byte = *bytes.get(end).ok_or(Error::malformed(UNEXPECTED_END))?;
        end += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 { break; }
        shift += 7;
        if (end - *pc) > (bits as usize).div_ceil(7) { return Err(Error::malformed(INT_TOO_LONG)); }
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return Err(Error::malformed(INT_TOO_LONG)); }

    if consumed > 1 {
        let used = (consumed - 1) * 7;
        if used < bits as usize {
            let rem = bits as usize - used;
            if rem < 8 && (byte as u32) >> rem != 0 { return Err(Error::malformed(INT_TOO_LARGE)); }
        }
    } else if bits < 7 && (byte as u32) >> bits != 0 {
        return Err(Error::malformed(INT_TOO_LARGE));
    }
    *pc = end;
    T::try_from(result).map_err(|_| Error::malformed(INT_TOO_LARGE))
}

/// Signed counterpart of [`safe_read_leb128`]; `bits` is 32, 33 or 64.
#[inline]
pub fn safe_read_sleb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    let mut byte: u8;
    loop {
        byte = *bytes.get(end).ok_or(Error::malformed(UNEXPECTED_END))?;
        end += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 { break; }
        if (end - *pc) > (bits as usize).div_ceil(7) { return Err(Error::malformed(INT_TOO_LONG)); }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64) << shift;
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return Err(Error::malformed(INT_TOO_LONG)); }

    // The unused high bits of the final byte must all match the sign bit.
    let used = (consumed - 1) * 7;
    if used + 7 > bits as usize {
        let significant = bits as usize - used;
        let sign_and_pad = (byte & 0x7f) >> (significant - 1).min(6);
        let all_pad = 0x7f >> (significant - 1).min(6);
        if sign_and_pad != 0 && sign_and_pad != all_pad { return Err(Error::malformed(INT_TOO_LARGE)); }
    }
    *pc = end;
    T::try_from(result).map_err(|_| Error::malformed(INT_TOO_LARGE))
}

/// Decodes an unsigned LEB128 integer from already validated code.
#[inline(always)]
pub fn read_leb128<T>(bytes: &[u8], pc: &mut usize) -> Result<T, Error>
where T: TryFrom<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *bytes.get(*pc).ok_or(Error::malformed(UNEXPECTED_END))?;
        *pc += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 {
            return T::try_from(result).map_err(|_| Error::malformed(INT_TOO_LARGE));
        }
        shift += 7;
    }
}

/// Decodes a signed LEB128 integer from already validated code.
#[inline(always)]
pub fn read_sleb128<T>(bytes: &[u8], pc: &mut usize) -> Result<T, Error>
where T: TryFrom<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut byte: u8;
    loop {
        byte = *bytes.get(*pc).ok_or(Error::malformed(UNEXPECTED_END))?;
        *pc += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 { break; }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64) << shift;
    }
    T::try_from(result).map_err(|_| Error::malformed(INT_TOO_LARGE))
}
