use std::fmt::{Display, Formatter};

use crate::error::*;
use crate::leb128::*;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
    /// Bottom type produced by unreachable code during validation.
    Any = 0xff,
}

impl Display for ValType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::Any => "any",
        })
    }
}

#[inline]
pub fn val_type_from_byte(byte: u8) -> Option<ValType> {
    match byte {
        0x7f => Some(ValType::I32),
        0x7e => Some(ValType::I64),
        0x7d => Some(ValType::F32),
        0x7c => Some(ValType::F64),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl Signature {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        Self { params: params.to_vec(), results: results.to_vec() }
    }

    #[inline]
    pub fn n_params(&self) -> usize { self.params.len() }
    #[inline]
    pub fn n_results(&self) -> usize { self.results.len() }

    /// Reads a block type: the empty type, a single value type, or a
    /// type-section index.
    pub fn read_blocktype(types: &[Signature], bytes: &[u8], idx: &mut usize) -> Result<Signature, Error> {
        const VOID: u8 = 0x40;
        let byte = *bytes.get(*idx).ok_or(Error::malformed(UNEXPECTED_END))?;
        if byte == VOID {
            *idx += 1;
            Ok(Signature::default())
        } else if let Some(vt) = val_type_from_byte(byte) {
            *idx += 1;
            Ok(Signature { params: vec![], results: vec![vt] })
        } else {
            let n: i64 = safe_read_sleb128(bytes, idx, 33)?;
            if n < 0 || (n as usize) >= types.len() {
                return Err(Error::malformed(INVALID_VALUE_TYPE));
            }
            Ok(types[n as usize].clone())
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let join = |tys: &[ValType]| tys.iter().map(ValType::to_string).collect::<Vec<_>>().join(", ");
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}
