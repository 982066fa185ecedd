use crate::byte_iter::ByteIter;
use crate::debug_println;
use crate::error::*;
use crate::leb128::*;
use crate::module::*;
use crate::signature::*;

// ---------------- Control Flow Structures ----------------
/// Each structured variant carries the offset of its block type
/// immediate, which keys the module's side table.
#[derive(Clone, Copy)]
pub enum ControlType {
    Function,
    Block { key: usize },
    Loop { key: usize },
    If { key: usize },
    IfElse { key: usize, else_pc: usize },
}

#[derive(Clone)]
pub struct ControlFrame {
    pub sig: Signature,
    /// Operand stack height on entry, below the block parameters.
    pub height: usize,
    pub unreachable: bool,
    pub body_pc: usize,
    pub control_type: ControlType,
}

impl ControlFrame {
    /// Types a branch to this frame must carry.
    fn label_types(&self) -> &[ValType] {
        match self.control_type {
            ControlType::Loop { .. } => &self.sig.params,
            _ => &self.sig.results,
        }
    }
}

// ---------------- ValidatorStack for Type Checking ----------------
pub struct ValidatorStack {
    buf: Vec<ValType>,
}

impl Default for ValidatorStack {
    fn default() -> Self { Self::new() }
}

impl ValidatorStack {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(1024) }
    }

    fn len(&self) -> usize { self.buf.len() }
    fn push(&mut self, ty: ValType) { self.buf.push(ty); }
    fn push_slice(&mut self, vals: &[ValType]) { self.buf.extend_from_slice(vals); }

    fn pop(&mut self, cs: &[ControlFrame]) -> Result<ValType, Error> {
        let frame = cs.last().ok_or(Error::malformed(UNEXPECTED_END))?;
        if self.buf.len() == frame.height {
            return if frame.unreachable { Ok(ValType::Any) } else { Err(Error::malformed(TYPE_MISMATCH)) };
        }
        self.buf.pop().ok_or(Error::malformed(TYPE_MISMATCH))
    }

    fn pop_expect(&mut self, cs: &[ControlFrame], expected: ValType) -> Result<ValType, Error> {
        let actual = self.pop(cs)?;
        if actual != expected && actual != ValType::Any && expected != ValType::Any {
            return Err(Error::malformed(TYPE_MISMATCH));
        }
        Ok(if actual == ValType::Any { expected } else { actual })
    }

    /// Pops `expected` from the top, returning the types actually found.
    fn pop_slice(&mut self, cs: &[ControlFrame], expected: &[ValType]) -> Result<Vec<ValType>, Error> {
        let mut popped = vec![ValType::Any; expected.len()];
        for (i, &ty) in expected.iter().enumerate().rev() {
            popped[i] = self.pop(cs).and_then(|actual| {
                if actual != ty && actual != ValType::Any {
                    Err(Error::malformed(TYPE_MISMATCH))
                } else {
                    Ok(actual)
                }
            })?;
        }
        Ok(popped)
    }

    fn apply_sig(&mut self, cs: &[ControlFrame], sig: &Signature) -> Result<(), Error> {
        self.pop_slice(cs, &sig.params)?;
        self.push_slice(&sig.results);
        Ok(())
    }

    /// Drops everything above the current frame and marks the rest of the
    /// block as unreachable.
    fn polymorphize(&mut self, cs: &mut [ControlFrame]) {
        if let Some(frame) = cs.last_mut() {
            self.buf.truncate(frame.height);
            frame.unreachable = true;
        }
    }
}

fn label(cs: &[ControlFrame], depth: u32) -> Result<&ControlFrame, Error> {
    let depth = depth as usize;
    if depth >= cs.len() {
        return Err(Error::malformed(UNKNOWN_LABEL));
    }
    Ok(&cs[cs.len() - depth - 1])
}

// ---------------- Function Validation ----------------
pub struct Validator<'a> {
    module: &'a mut Module,
}

impl<'a> Validator<'a> {
    pub fn new(module: &'a mut Module) -> Self {
        Self { module }
    }

    /// Type-checks one function body and records the branch targets of
    /// its structured instructions in the module's side table.
    pub fn validate_function(&mut self, fn_index: usize) -> Result<(), Error> {
        let func = self.module.functions[fn_index].clone();
        let bytes = self.module.bytes.clone();
        let mut it = ByteIter::new(&bytes[..func.body.end], func.body.start);
        let mut vs = ValidatorStack::new();
        let mut cs: Vec<ControlFrame> = Vec::with_capacity(64);

        cs.push(ControlFrame {
            sig: func.ty.clone(),
            height: 0,
            unreachable: false,
            body_pc: func.body.start,
            control_type: ControlType::Function,
        });

        // The function frame is popped by its final `end`.
        let validators = get_validators();
        while !cs.is_empty() {
            let byte = it.read_u8()?;
            validators[byte as usize](self.module, &mut it, &func, &mut vs, &mut cs)?;
        }

        if it.cur() != func.body.end {
            return Err(Error::malformed(SECTION_SIZE_MISMATCH));
        }
        Ok(())
    }
}

// ---------------- Validator Function Type ----------------
type ValidatorFn = fn(&mut Module, &mut ByteIter, &Function, &mut ValidatorStack, &mut Vec<ControlFrame>) -> Result<(), Error>;

fn validate_missing(_: &mut Module, _: &mut ByteIter, _: &Function, _: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    Err(Error::malformed(UNKNOWN_INSTRUCTION))
}

// ---------------- Control Flow Validators ----------------
fn validate_unreachable(_: &mut Module, _: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    vs.polymorphize(cs);
    Ok(())
}

fn validate_nop(_: &mut Module, _: &mut ByteIter, _: &Function, _: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    Ok(())
}

fn enter_block(m: &mut Module, it: &mut ByteIter, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>, make: fn(usize) -> ControlType) -> Result<(), Error> {
    let key = it.cur();
    let sig = Signature::read_blocktype(&m.types, it.bytes, &mut it.idx)?;
    vs.pop_slice(cs, &sig.params)?;
    let height = vs.len();
    vs.push_slice(&sig.params);
    cs.push(ControlFrame { sig, height, unreachable: false, body_pc: it.cur(), control_type: make(key) });
    Ok(())
}

fn validate_block(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    debug_println!("[val] block key={}", it.cur());
    enter_block(m, it, vs, cs, |key| ControlType::Block { key })
}

fn validate_loop(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    debug_println!("[val] loop key={}", it.cur());
    enter_block(m, it, vs, cs, |key| ControlType::Loop { key })
}

fn validate_if(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    debug_println!("[val] if key={}", it.cur());
    vs.pop_expect(cs, ValType::I32)?;
    enter_block(m, it, vs, cs, |key| ControlType::If { key })
}

fn validate_else(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let (key, results, height) = match cs.last() {
        Some(ControlFrame { control_type: ControlType::If { key }, sig, height, .. }) => (*key, sig.results.clone(), *height),
        _ => return Err(Error::malformed(ELSE_MUST_CLOSE_IF)),
    };
    vs.pop_slice(cs, &results)?;
    if vs.len() != height {
        return Err(Error::malformed(TYPE_MISMATCH));
    }
    if let Some(top) = cs.last_mut() {
        top.control_type = ControlType::IfElse { key, else_pc: it.cur() };
        top.unreachable = false;
        vs.push_slice(&top.sig.params);
    }
    Ok(())
}

fn validate_end(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let (results, height) = match cs.last() {
        Some(top) => (top.sig.results.clone(), top.height),
        None => return Err(Error::malformed(UNEXPECTED_END)),
    };
    vs.pop_slice(cs, &results)?;
    if vs.len() != height {
        return Err(Error::malformed(TYPE_MISMATCH));
    }
    let Some(top) = cs.pop() else { return Err(Error::malformed(UNEXPECTED_END)) };

    let info = |else_pc| BlockInfo {
        body_pc: top.body_pc,
        end_pc: it.cur(),
        else_pc,
        n_params: top.sig.n_params() as u32,
        n_results: top.sig.n_results() as u32,
    };
    let entry = match top.control_type {
        ControlType::Function => None,
        ControlType::Block { key } | ControlType::Loop { key } => Some((key, info(None))),
        ControlType::If { key } => {
            if top.sig.params != top.sig.results {
                return Err(Error::malformed(TYPE_MISMATCH));
            }
            Some((key, info(None)))
        }
        ControlType::IfElse { key, else_pc } => Some((key, info(Some(else_pc)))),
    };
    if let Some((key, info)) = entry {
        debug_println!("[val] end key={} -> {:?}", key, info);
        m.side_table.insert(key, info);
        vs.push_slice(&results);
    }
    Ok(())
}

fn validate_br(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let depth: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let expected = label(cs, depth)?.label_types().to_vec();
    vs.pop_slice(cs, &expected)?;
    vs.polymorphize(cs);
    Ok(())
}

fn validate_br_if(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let depth: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    vs.pop_expect(cs, ValType::I32)?;
    let expected = label(cs, depth)?.label_types().to_vec();
    vs.pop_slice(cs, &expected)?;
    vs.push_slice(&expected);
    Ok(())
}

fn validate_br_table(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let n_targets: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let mut targets: Vec<u32> = Vec::with_capacity((n_targets as usize).min(1024));
    for _ in 0..n_targets {
        targets.push(safe_read_leb128(it.bytes, &mut it.idx, 32)?);
    }
    let default_depth: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    vs.pop_expect(cs, ValType::I32)?;

    let default_types = label(cs, default_depth)?.label_types().to_vec();
    for &depth in &targets {
        let expected = label(cs, depth)?.label_types().to_vec();
        if expected.len() != default_types.len() {
            return Err(Error::malformed(TYPE_MISMATCH));
        }
        let found = vs.pop_slice(cs, &expected)?;
        vs.push_slice(&found);
    }
    vs.pop_slice(cs, &default_types)?;
    vs.polymorphize(cs);
    Ok(())
}

fn validate_return(_: &mut Module, _: &mut ByteIter, f: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    vs.pop_slice(cs, &f.ty.results)?;
    vs.polymorphize(cs);
    Ok(())
}

// ---------------- Stack Manipulation ----------------
fn validate_drop(_: &mut Module, _: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    vs.pop(cs)?;
    Ok(())
}

fn validate_select(_: &mut Module, _: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    vs.pop_expect(cs, ValType::I32)?;
    let t1 = vs.pop(cs)?;
    let t2 = vs.pop(cs)?;
    if t1 != t2 && t1 != ValType::Any && t2 != ValType::Any {
        return Err(Error::malformed(TYPE_MISMATCH));
    }
    vs.push(if t1 == ValType::Any { t2 } else { t1 });
    Ok(())
}

// ---------------- Variable Instructions ----------------
fn local_type(it: &mut ByteIter, f: &Function) -> Result<ValType, Error> {
    let local_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    f.locals.get(local_idx as usize).copied().ok_or(Error::malformed(UNKNOWN_LOCAL))
}

fn validate_localget(_: &mut Module, it: &mut ByteIter, f: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let ty = local_type(it, f)?;
    vs.push(ty);
    Ok(())
}

fn validate_localset(_: &mut Module, it: &mut ByteIter, f: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let ty = local_type(it, f)?;
    vs.pop_expect(cs, ty)?;
    Ok(())
}

fn validate_localtee(_: &mut Module, it: &mut ByteIter, f: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let ty = local_type(it, f)?;
    vs.pop_expect(cs, ty)?;
    vs.push(ty);
    Ok(())
}

fn validate_globalget(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let global_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let global = m.globals.get(global_idx as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
    vs.push(global.ty);
    Ok(())
}

fn validate_globalset(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let global_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let global = m.globals.get(global_idx as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
    if !global.is_mutable {
        return Err(Error::malformed(GLOBAL_IS_IMMUTABLE));
    }
    vs.pop_expect(cs, global.ty)?;
    Ok(())
}

// ---------------- Memory Instructions ----------------
fn zero_flag(it: &mut ByteIter) -> Result<(), Error> {
    if it.read_u8()? != 0 {
        return Err(Error::malformed(ZERO_FLAG_EXPECTED));
    }
    Ok(())
}

fn validate_memorysize(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    zero_flag(it)?;
    if m.memory.is_none() {
        return Err(Error::malformed(UNKNOWN_MEMORY));
    }
    vs.push(ValType::I32);
    Ok(())
}

fn validate_memorygrow(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    zero_flag(it)?;
    if m.memory.is_none() {
        return Err(Error::malformed(UNKNOWN_MEMORY));
    }
    vs.pop_expect(cs, ValType::I32)?;
    vs.push(ValType::I32);
    Ok(())
}

fn read_memarg(m: &Module, it: &mut ByteIter, natural_align: u32) -> Result<(), Error> {
    let align_bits: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let _offset: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if m.memory.is_none() {
        return Err(Error::malformed(UNKNOWN_MEMORY));
    }
    if align_bits >= 32 || (1u64 << align_bits) > natural_align as u64 {
        return Err(Error::malformed(ALIGNMENT_TOO_LARGE));
    }
    Ok(())
}

fn validate_load(m: &mut Module, it: &mut ByteIter, val_ty: ValType, natural_align: u32, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    read_memarg(m, it, natural_align)?;
    vs.pop_expect(cs, ValType::I32)?;
    vs.push(val_ty);
    Ok(())
}

fn validate_store(m: &mut Module, it: &mut ByteIter, val_ty: ValType, natural_align: u32, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    read_memarg(m, it, natural_align)?;
    vs.pop_slice(cs, &[ValType::I32, val_ty])?;
    Ok(())
}

macro_rules! load {
    ($name:ident, $ty:expr, $align:expr) => {
        fn $name(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
            validate_load(m, it, $ty, $align, vs, cs)
        }
    }
}

macro_rules! store {
    ($name:ident, $ty:expr, $align:expr) => {
        fn $name(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
            validate_store(m, it, $ty, $align, vs, cs)
        }
    }
}

load!(validate_i32load, ValType::I32, 4); load!(validate_i64load, ValType::I64, 8);
load!(validate_f32load, ValType::F32, 4); load!(validate_f64load, ValType::F64, 8);
load!(validate_i32load8, ValType::I32, 1); load!(validate_i32load16, ValType::I32, 2);
load!(validate_i64load8, ValType::I64, 1); load!(validate_i64load16, ValType::I64, 2);
load!(validate_i64load32, ValType::I64, 4);
store!(validate_i32store, ValType::I32, 4); store!(validate_i64store, ValType::I64, 8);
store!(validate_f32store, ValType::F32, 4); store!(validate_f64store, ValType::F64, 8);
store!(validate_i32store8, ValType::I32, 1); store!(validate_i32store16, ValType::I32, 2);
store!(validate_i64store8, ValType::I64, 1); store!(validate_i64store16, ValType::I64, 2);
store!(validate_i64store32, ValType::I64, 4);

// ---------------- Constant Instructions ----------------
fn validate_i32const(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let _val: i32 = safe_read_sleb128(it.bytes, &mut it.idx, 32)?;
    vs.push(ValType::I32);
    Ok(())
}

fn validate_i64const(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let _val: i64 = safe_read_sleb128(it.bytes, &mut it.idx, 64)?;
    vs.push(ValType::I64);
    Ok(())
}

fn validate_f32const(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    if !it.has_n_left(4) {
        return Err(Error::malformed(UNEXPECTED_END));
    }
    it.advance(4);
    vs.push(ValType::F32);
    Ok(())
}

fn validate_f64const(_: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, _: &mut Vec<ControlFrame>) -> Result<(), Error> {
    if !it.has_n_left(8) {
        return Err(Error::malformed(UNEXPECTED_END));
    }
    it.advance(8);
    vs.push(ValType::F64);
    Ok(())
}

// ---------------- Numeric Operations ----------------
macro_rules! numeric {
    ($name:ident, $in:expr, $out:expr) => {
        fn $name(_: &mut Module, _: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
            vs.pop_slice(cs, $in)?;
            vs.push($out);
            Ok(())
        }
    }
}

numeric!(validate_i32_i32, &[ValType::I32], ValType::I32);
numeric!(validate_i64_i64, &[ValType::I64], ValType::I64);
numeric!(validate_f32_f32, &[ValType::F32], ValType::F32);
numeric!(validate_f64_f64, &[ValType::F64], ValType::F64);
numeric!(validate_i32i32_i32, &[ValType::I32, ValType::I32], ValType::I32);
numeric!(validate_i64i64_i64, &[ValType::I64, ValType::I64], ValType::I64);
numeric!(validate_f32f32_f32, &[ValType::F32, ValType::F32], ValType::F32);
numeric!(validate_f64f64_f64, &[ValType::F64, ValType::F64], ValType::F64);
numeric!(validate_i64_i32, &[ValType::I64], ValType::I32);
numeric!(validate_f32_i32, &[ValType::F32], ValType::I32);
numeric!(validate_f64_i32, &[ValType::F64], ValType::I32);
numeric!(validate_i64i64_i32, &[ValType::I64, ValType::I64], ValType::I32);
numeric!(validate_f32f32_i32, &[ValType::F32, ValType::F32], ValType::I32);
numeric!(validate_f64f64_i32, &[ValType::F64, ValType::F64], ValType::I32);
numeric!(validate_i32_i64, &[ValType::I32], ValType::I64);
numeric!(validate_f32_i64, &[ValType::F32], ValType::I64);
numeric!(validate_f64_i64, &[ValType::F64], ValType::I64);
numeric!(validate_i32_f32, &[ValType::I32], ValType::F32);
numeric!(validate_i64_f32, &[ValType::I64], ValType::F32);
numeric!(validate_f64_f32, &[ValType::F64], ValType::F32);
numeric!(validate_i32_f64, &[ValType::I32], ValType::F64);
numeric!(validate_i64_f64, &[ValType::I64], ValType::F64);
numeric!(validate_f32_f64, &[ValType::F32], ValType::F64);

// ---------------- Call Instructions ----------------
fn validate_call(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let func_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let callee = m.functions.get(func_idx as usize).ok_or(Error::malformed(UNKNOWN_FUNC))?;
    vs.apply_sig(cs, &callee.ty)
}

fn validate_call_indirect(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let type_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    zero_flag(it)?;
    if m.table.is_none() {
        return Err(Error::malformed(UNKNOWN_TABLE));
    }
    let sig = m.types.get(type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
    vs.pop_expect(cs, ValType::I32)?;
    vs.apply_sig(cs, sig)
}

// ---------------- Prefixed Instructions ----------------
/// Saturating truncation and the bulk `memory.copy`/`memory.fill` pair.
fn validate_prefixed(m: &mut Module, it: &mut ByteIter, _: &Function, vs: &mut ValidatorStack, cs: &mut Vec<ControlFrame>) -> Result<(), Error> {
    let sub: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let (input, output) = match sub {
        0 | 1 => (ValType::F32, ValType::I32),
        2 | 3 => (ValType::F64, ValType::I32),
        4 | 5 => (ValType::F32, ValType::I64),
        6 | 7 => (ValType::F64, ValType::I64),
        10 | 11 => {
            zero_flag(it)?;
            if sub == 10 { zero_flag(it)?; }
            if m.memory.is_none() {
                return Err(Error::malformed(UNKNOWN_MEMORY));
            }
            vs.pop_slice(cs, &[ValType::I32; 3])?;
            return Ok(());
        }
        _ => return Err(Error::malformed(UNKNOWN_INSTRUCTION)),
    };
    vs.pop_expect(cs, input)?;
    vs.push(output);
    Ok(())
}

// ---------------- Validator Table ----------------
fn build_validators_table() -> [ValidatorFn; 256] {
    let mut t: [ValidatorFn; 256] = [validate_missing; 256];
        // Control flow
        t[0x00] = validate_unreachable; t[0x01] = validate_nop;
        t[0x02] = validate_block; t[0x03] = validate_loop;
        t[0x04] = validate_if; t[0x05] = validate_else;
        t[0x0b] = validate_end; t[0x0c] = validate_br;
        t[0x0d] = validate_br_if; t[0x0e] = validate_br_table;
        t[0x0f] = validate_return;
        // Call instructions
        t[0x10] = validate_call; t[0x11] = validate_call_indirect;
        // Stack manipulation
        t[0x1a] = validate_drop; t[0x1b] = validate_select;
        // Variable instructions
        t[0x20] = validate_localget; t[0x21] = validate_localset;
        t[0x22] = validate_localtee; t[0x23] = validate_globalget;
        t[0x24] = validate_globalset;
        // Memory loads
        t[0x28] = validate_i32load; t[0x29] = validate_i64load;
        t[0x2a] = validate_f32load; t[0x2b] = validate_f64load;
        t[0x2c] = validate_i32load8; t[0x2d] = validate_i32load8;
        t[0x2e] = validate_i32load16; t[0x2f] = validate_i32load16;
        t[0x30] = validate_i64load8; t[0x31] = validate_i64load8;
        t[0x32] = validate_i64load16; t[0x33] = validate_i64load16;
        t[0x34] = validate_i64load32; t[0x35] = validate_i64load32;
        // Memory stores
        t[0x36] = validate_i32store; t[0x37] = validate_i64store;
        t[0x38] = validate_f32store; t[0x39] = validate_f64store;
        t[0x3a] = validate_i32store8; t[0x3b] = validate_i32store16;
        t[0x3c] = validate_i64store8; t[0x3d] = validate_i64store16;
        t[0x3e] = validate_i64store32;
        // Memory size/grow
        t[0x3f] = validate_memorysize; t[0x40] = validate_memorygrow;
        // Constants
        t[0x41] = validate_i32const; t[0x42] = validate_i64const;
        t[0x43] = validate_f32const; t[0x44] = validate_f64const;
        // Numeric operations
        t[0x45] = validate_i32_i32; // i32.eqz
        for i in 0x46..=0x4f { t[i] = validate_i32i32_i32; } // i32 comparisons
        t[0x50] = validate_i64_i32; // i64.eqz
        for i in 0x51..=0x5a { t[i] = validate_i64i64_i32; } // i64 comparisons
        for i in 0x5b..=0x60 { t[i] = validate_f32f32_i32; } // f32 comparisons
        for i in 0x61..=0x66 { t[i] = validate_f64f64_i32; } // f64 comparisons
        for i in 0x67..=0x69 { t[i] = validate_i32_i32; } // i32 unary
        for i in 0x6a..=0x78 { t[i] = validate_i32i32_i32; } // i32 binary
        for i in 0x79..=0x7b { t[i] = validate_i64_i64; } // i64 unary
        for i in 0x7c..=0x8a { t[i] = validate_i64i64_i64; } // i64 binary
        for i in 0x8b..=0x91 { t[i] = validate_f32_f32; } // f32 unary
        for i in 0x92..=0x98 { t[i] = validate_f32f32_f32; } // f32 binary
        for i in 0x99..=0x9f { t[i] = validate_f64_f64; } // f64 unary
        for i in 0xa0..=0xa6 { t[i] = validate_f64f64_f64; } // f64 binary
        // Conversions
        t[0xa7] = validate_i64_i32; t[0xa8] = validate_f32_i32;
        t[0xa9] = validate_f32_i32; t[0xaa] = validate_f64_i32;
        t[0xab] = validate_f64_i32; t[0xac] = validate_i32_i64;
        t[0xad] = validate_i32_i64; t[0xae] = validate_f32_i64;
        t[0xaf] = validate_f32_i64; t[0xb0] = validate_f64_i64;
        t[0xb1] = validate_f64_i64; t[0xb2] = validate_i32_f32;
        t[0xb3] = validate_i32_f32; t[0xb4] = validate_i64_f32;
        t[0xb5] = validate_i64_f32; t[0xb6] = validate_f64_f32;
        t[0xb7] = validate_i32_f64; t[0xb8] = validate_i32_f64;
        t[0xb9] = validate_i64_f64; t[0xba] = validate_i64_f64;
        t[0xbb] = validate_f32_f64; t[0xbc] = validate_f32_i32;
        t[0xbd] = validate_f64_i64; t[0xbe] = validate_i32_f32;
        t[0xbf] = validate_i64_f64;
        // Sign extension
        t[0xc0] = validate_i32_i32; t[0xc1] = validate_i32_i32;
        t[0xc2] = validate_i64_i64; t[0xc3] = validate_i64_i64;
        t[0xc4] = validate_i64_i64;
        t[0xfc] = validate_prefixed;
    t
}

fn get_validators() -> &'static [ValidatorFn; 256] {
    static VALIDATORS: std::sync::LazyLock<Box<[ValidatorFn; 256]>> = std::sync::LazyLock::new(|| {
        Box::new(build_validators_table())
    });
    &VALIDATORS
}
