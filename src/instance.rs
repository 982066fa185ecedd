use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use paste::paste;
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::*;
use crate::gas::GasMeter;
use crate::leb128::*;
use crate::module::*;
use crate::signature::*;
use crate::wasm_memory::WasmMemory;

/// Untyped 64-bit slot. Floats are stored as their bit patterns, so
/// reinterpret instructions are no-ops.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WasmValue(pub u64);

impl WasmValue {
    #[inline] pub fn from_i32(v: i32) -> Self { Self(v as u32 as u64) }
    #[inline] pub fn as_i32(self) -> i32 { self.0 as u32 as i32 }
    #[inline] pub fn from_u32(v: u32) -> Self { Self(v as u64) }
    #[inline] pub fn as_u32(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_i64(v: i64) -> Self { Self(v as u64) }
    #[inline] pub fn as_i64(self) -> i64 { self.0 as i64 }
    #[inline] pub fn from_u64(v: u64) -> Self { Self(v) }
    #[inline] pub fn as_u64(self) -> u64 { self.0 }
    #[inline] pub fn from_f32_bits(bits: u32) -> Self { Self(bits as u64) }
    #[inline] pub fn as_f32_bits(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_f64_bits(bits: u64) -> Self { Self(bits) }
    #[inline] pub fn as_f64_bits(self) -> u64 { self.0 }
    #[inline] pub fn from_f32(v: f32) -> Self { Self::from_f32_bits(v.to_bits()) }
    #[inline] pub fn as_f32(self) -> f32 { f32::from_bits(self.as_f32_bits()) }
    #[inline] pub fn from_f64(v: f64) -> Self { Self::from_f64_bits(v.to_bits()) }
    #[inline] pub fn as_f64(self) -> f64 { f64::from_bits(self.as_f64_bits()) }
}

// ---------------- Host functions ----------------
/// Access handed to a host function for the duration of one call.
pub struct Caller<'a> {
    memory: Option<&'a RefCell<WasmMemory>>,
    meter: &'a mut GasMeter,
    copy_cost: u64,
}

impl<'a> Caller<'a> {
    pub fn new(memory: Option<&'a RefCell<WasmMemory>>, meter: &'a mut GasMeter, copy_cost: u64) -> Self {
        Self { memory, meter, copy_cost }
    }

    pub fn charge(&mut self, cost: u64) -> Result<(), Error> {
        self.meter.charge(cost)
    }

    pub fn gas_left(&self) -> u64 { self.meter.remaining() }

    /// Copies `length` bytes out of linear memory, charging per byte.
    pub fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        if length == 0 { return Ok(Vec::new()); }
        self.meter.charge_scaled(0, self.copy_cost, length as usize)?;
        let memory = self.memory.ok_or(Error::OutOfBounds)?;
        let bytes = memory.borrow().read(offset, length)?;
        Ok(bytes)
    }

    /// Copies `bytes` into linear memory, charging per byte.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() { return Ok(()); }
        self.meter.charge_scaled(0, self.copy_cost, bytes.len())?;
        let memory = self.memory.ok_or(Error::OutOfBounds)?;
        memory.borrow_mut().write(offset, bytes)
    }
}

pub type HostCallback = Rc<dyn Fn(&mut Caller<'_>, &[WasmValue]) -> Result<Option<WasmValue>, Error>>;

#[derive(Clone)]
pub struct HostFunction {
    pub signature: Signature,
    pub callback: HostCallback,
}

/// Host functions available to a module, keyed by import field name.
pub type HostFunctions = HashMap<String, HostFunction>;

#[derive(Clone)]
pub enum RuntimeFunction {
    OwnedWasm { n_params: usize, n_results: usize, pc_start: usize, locals_count: usize },
    Host { callback: HostCallback, n_params: usize, n_results: usize, name: String },
}

// ---------------- Interpreter state ----------------
#[derive(Clone, Copy, Debug)]
struct Label {
    stack_len: usize,
    dest_pc: usize,
    arity: usize,
    is_loop: bool,
}

#[derive(Clone, Copy, Debug)]
struct Frame {
    return_pc: usize,
    locals_base: usize,
    label_base: usize,
    n_results: usize,
}

pub struct Instance {
    module: ModuleHandle,
    functions: Vec<RuntimeFunction>,
    globals: Vec<Cell<WasmValue>>,
    memory: Option<RefCell<WasmMemory>>,
    table: Vec<Option<u32>>,
    instruction_cost: u64,
    copy_cost: u64,
    local_cost: u64,
}

impl Instance {
    pub const MAX_CALL_DEPTH: usize = 1000;

    /// Creates a fresh instance: binds host functions, allocates memory
    /// and the table, applies segments and runs the start function.
    pub fn instantiate(module: ModuleHandle, host: &HostFunctions, config: &EngineConfig, meter: &mut GasMeter) -> Result<Self, Error> {
        let mut functions = Vec::with_capacity(module.functions.len());
        for f in &module.functions {
            let (n_params, n_results) = (f.ty.n_params(), f.ty.n_results());
            match &f.import {
                Some(import) => {
                    let unresolved = || Error::UnresolvedImport { module: import.module.clone(), field: import.field.clone() };
                    let hf = host.get(&import.field).ok_or_else(unresolved)?;
                    if hf.signature != f.ty {
                        return Err(unresolved());
                    }
                    functions.push(RuntimeFunction::Host { callback: hf.callback.clone(), n_params, n_results, name: import.field.clone() });
                }
                None => functions.push(RuntimeFunction::OwnedWasm {
                    n_params,
                    n_results,
                    pc_start: f.body.start,
                    locals_count: f.locals.len() - n_params,
                }),
            }
        }

        let memory = module.memory.as_ref().map(|m| {
            RefCell::new(WasmMemory::new(m.min, m.max.min(config.max_memory_pages)))
        });
        let table = match &module.table {
            Some(t) if t.min > config.max_table_elements => return Err(Error::MemoryLimitExceeded),
            Some(t) => vec![None; t.min as usize],
            None => Vec::new(),
        };

        let mut inst = Instance {
            module: module.clone(),
            functions,
            globals: Vec::with_capacity(module.globals.len()),
            memory,
            table,
            instruction_cost: config.schedule.instruction,
            copy_cost: config.schedule.per_byte_copy,
            local_cost: config.schedule.per_local,
        };

        for global in &module.globals {
            if let Some(import) = &global.import {
                return Err(Error::UnresolvedImport { module: import.module.clone(), field: import.field.clone() });
            }
            let value = inst.eval_const(global.initializer_offset)?;
            inst.globals.push(Cell::new(value));
        }

        for segment in &module.elements {
            let offset = inst.eval_const(segment.initializer_offset)?.as_u32() as usize;
            let end = offset.checked_add(segment.func_indices.len()).ok_or(Error::trap(ELEM_SEG_DNF))?;
            let slots = inst.table.get_mut(offset..end).ok_or(Error::trap(ELEM_SEG_DNF))?;
            for (slot, &func_idx) in slots.iter_mut().zip(&segment.func_indices) {
                *slot = Some(func_idx);
            }
        }

        for segment in &module.data_segments {
            let offset = inst.eval_const(segment.initializer_offset)?.as_u32();
            let data = &module.bytes[segment.data_range.clone()];
            let memory = inst.memory.as_ref().ok_or(Error::trap(DATA_SEG_DNF))?;
            let fits = (offset as usize).checked_add(data.len()).is_some_and(|end| end <= memory.borrow().byte_len());
            if !fits {
                return Err(Error::trap(DATA_SEG_DNF));
            }
            memory.borrow_mut().write(offset, data)?;
        }

        if let Some(start) = module.start {
            inst.call(start as usize, &[], meter)?;
        }
        Ok(inst)
    }

    pub fn module(&self) -> &ModuleHandle { &self.module }

    pub fn memory(&self) -> Option<Ref<'_, WasmMemory>> {
        self.memory.as_ref().map(RefCell::borrow)
    }

    pub fn global(&self, idx: usize) -> Option<WasmValue> {
        self.globals.get(idx).map(Cell::get)
    }

    /// Runs a parameterless, resultless exported entry point.
    pub fn invoke_export(&self, name: &str, meter: &mut GasMeter) -> Result<(), Error> {
        let func_idx = match self.module.exports.get(name) {
            Some(Export { kind: ExternKind::Func, idx }) => *idx as usize,
            _ => return Err(Error::EntryPointNotFound(name.to_string())),
        };
        self.call(func_idx, &[], meter)?;
        Ok(())
    }

    /// Calls any function of the instance by index.
    pub fn call(&self, func_idx: usize, args: &[WasmValue], meter: &mut GasMeter) -> Result<Vec<WasmValue>, Error> {
        match self.functions.get(func_idx) {
            Some(RuntimeFunction::Host { callback, .. }) => {
                let callback = callback.clone();
                let mut caller = Caller::new(self.memory.as_ref(), meter, self.copy_cost);
                Ok(callback(&mut caller, args)?.into_iter().collect())
            }
            Some(&RuntimeFunction::OwnedWasm { n_params, n_results, pc_start, locals_count }) => {
                if args.len() != n_params {
                    return Err(Error::trap(INDIRECT_CALL_MISMATCH));
                }
                let mut stack: Vec<WasmValue> = Vec::with_capacity(1024);
                stack.extend_from_slice(args);
                meter.charge_scaled(0, self.local_cost, locals_count)?;
                stack.resize(stack.len() + locals_count, WasmValue::default());
                let mut labels: Vec<Label> = Vec::with_capacity(256);
                let mut frames: Vec<Frame> = Vec::with_capacity(64);
                frames.push(Frame { return_pc: 0, locals_base: 0, label_base: 0, n_results });
                self.interpret(pc_start, &mut stack, &mut labels, &mut frames, meter)?;
                Ok(stack)
            }
            None => Err(Error::malformed(UNKNOWN_FUNC)),
        }
    }

    fn eval_const(&self, offset: usize) -> Result<WasmValue, Error> {
        let bytes = &self.module.bytes;
        let mut pc = offset + 1;
        let op = *bytes.get(offset).ok_or(Error::malformed(UNEXPECTED_END))?;
        match op {
            0x41 => Ok(WasmValue::from_i32(read_sleb128(bytes, &mut pc)?)),
            0x42 => Ok(WasmValue::from_i64(read_sleb128(bytes, &mut pc)?)),
            0x43 => Ok(WasmValue::from_f32_bits(u32::from_le_bytes(read_array(bytes, pc)?))),
            0x44 => Ok(WasmValue::from_f64_bits(u64::from_le_bytes(read_array(bytes, pc)?))),
            0x23 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                self.global(idx as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))
            }
            _ => Err(Error::malformed(CONST_EXP_REQUIRED)),
        }
    }

    fn interpret(
        &self,
        mut pc: usize,
        stack: &mut Vec<WasmValue>,
        labels: &mut Vec<Label>,
        frames: &mut Vec<Frame>,
        meter: &mut GasMeter,
    ) -> Result<(), Error> {
        let bytes = &self.module.bytes[..];
        let mem = self.memory.as_ref();
        let mut locals_base = 0usize;
        let mut label_base = 0usize;

        macro_rules! next_op { () => {{
            let byte = *bytes.get(pc).ok_or(Error::malformed(UNEXPECTED_END))?;
            pc += 1;
            byte
        }} }
        macro_rules! pop_val { () => {{
            match stack.pop() { Some(v) => v, None => return Err(Error::trap(STACK_UNDERFLOW)) }
        }} }
        macro_rules! block_info { () => {{
            *self.module.side_table.get(&pc).ok_or(Error::malformed(UNKNOWN_LABEL))?
        }} }
        macro_rules! binary {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a $op b));
                }
            }};
            ($type:ident, .$method:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.$method(b)));
                }
            }};
        }
        macro_rules! compare {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::from_u32((a $op b) as u32));
                }
            }};
        }
        macro_rules! shift {
            (u32, $op:tt) => {{
                let b = pop_val!().as_u32() % 32;
                let a = pop_val!().as_u32();
                stack.push(WasmValue::from_u32(a $op b));
            }};
            (u64, $op:tt) => {{
                let b = pop_val!().as_u64() % 64;
                let a = pop_val!().as_u64();
                stack.push(WasmValue::from_u64(a $op b));
            }};
        }
        macro_rules! rotate {
            (u32, $dir:ident) => {{
                let b = pop_val!().as_u32();
                let a = pop_val!().as_u32();
                paste! {
                    stack.push(WasmValue::from_u32(a.[<rotate_ $dir>](b % 32)));
                }
            }};
            (u64, $dir:ident) => {{
                let b = pop_val!().as_u64();
                let a = pop_val!().as_u64();
                paste! {
                    stack.push(WasmValue::from_u64(a.[<rotate_ $dir>]((b % 64) as u32)));
                }
            }};
        }
        macro_rules! unary {
            ($type:ident, $f:expr) => {{
                paste! {
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>]($f(a)));
                }
            }};
        }
        macro_rules! minmax {
            ($type:ident, min) => {{ minmax!(@impl $type, min, true) }};
            ($type:ident, max) => {{ minmax!(@impl $type, max, false) }};
            (@impl $type:ident, $op:ident, $want_negative:literal) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();

                    let result = if a.is_nan() {
                        a
                    } else if b.is_nan() {
                        b
                    } else if a == b && a == 0.0 {
                        if a.is_sign_negative() == $want_negative { a } else { b }
                    } else {
                        a.$op(b)
                    };

                    stack.push(WasmValue::[<from_ $type>](result));
                }
            }};
        }
        macro_rules! shr_s {
            ($int_type:ident, $uint_type:ident, $bits:literal) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint_type>]() % $bits;
                    let a = pop_val!().[<as_ $int_type>]();
                    stack.push(WasmValue::[<from_ $int_type>](a >> b));
                }
            }};
        }
        macro_rules! copysign {
            ($type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.copysign(b)));
                }
            }};
        }
        macro_rules! nearest {
            ($type:ident) => {{
                paste! {
                    let x = pop_val!().[<as_ $type>]();
                    let y = if x.is_nan() || x.is_infinite() {
                        x
                    } else {
                        let lower = x.floor();
                        let upper = x.ceil();
                        let dl = x - lower;
                        let du = upper - x;
                        let rounded = if dl < du {
                            lower
                        } else if dl > du {
                            upper
                        } else if (lower % 2.0) == 0.0 {
                            lower
                        } else {
                            upper
                        };
                        rounded.copysign(x)
                    };
                    stack.push(WasmValue::[<from_ $type>](y));
                }
            }};
        }
        // `as` casts from floats saturate and map NaN to zero, which is
        // exactly the `trunc_sat` family.
        macro_rules! convert {
            ($src_type:ident -> $dst_type:ident) => {{
                paste! {
                    let v = pop_val!().[<as_ $src_type>]();
                    stack.push(WasmValue::[<from_ $dst_type>](v as $dst_type));
                }
            }};
        }
        macro_rules! trunc {
            ($src_type:ident -> $dst_type:ident : $min:expr, $max:expr) => {{
                paste! {
                    let x = pop_val!().[<as_ $src_type>]();
                    if x.is_nan() {
                        return Err(Error::trap(INVALID_CONV_TO_INT));
                    }
                    if x.is_infinite() || x <= $min || x >= $max {
                        return Err(Error::trap(INTEGER_OVERFLOW));
                    }
                    stack.push(WasmValue::[<from_ $dst_type>](x as $dst_type));
                }
            }};
        }
        macro_rules! div_s {
            ($int_type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $int_type>]();
                    let a = pop_val!().[<as_ $int_type>]();
                    if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                    if a == $int_type::MIN && b == -1 { return Err(Error::trap(INTEGER_OVERFLOW)); }
                    stack.push(WasmValue::[<from_ $int_type>](a / b));
                }
            }};
        }
        macro_rules! div_u {
            ($uint_type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint_type>]();
                    let a = pop_val!().[<as_ $uint_type>]();
                    if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                    stack.push(WasmValue::[<from_ $uint_type>](a / b));
                }
            }};
        }
        macro_rules! rem_s {
            ($int_type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $int_type>]();
                    let a = pop_val!().[<as_ $int_type>]();
                    if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                    stack.push(WasmValue::[<from_ $int_type>](a.wrapping_rem(b)));
                }
            }};
        }
        macro_rules! rem_u {
            ($uint_type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint_type>]();
                    let a = pop_val!().[<as_ $uint_type>]();
                    if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                    stack.push(WasmValue::[<from_ $uint_type>](a % b));
                }
            }};
        }
        macro_rules! load { ($method:ident, $push:expr) => {{
            let _align: u32 = read_leb128(bytes, &mut pc)?;
            let offset: u32 = read_leb128(bytes, &mut pc)?;
            let addr = pop_val!().as_u32();
            let mem = mem.ok_or(Error::OutOfBounds)?;
            let v = mem.borrow().$method(addr, offset)?;
            stack.push(($push)(v));
        }}}
        macro_rules! store { ($method:ident, $from:expr) => {{
            let _align: u32 = read_leb128(bytes, &mut pc)?;
            let offset: u32 = read_leb128(bytes, &mut pc)?;
            let raw = pop_val!();
            let addr = pop_val!().as_u32();
            let mem = mem.ok_or(Error::OutOfBounds)?;
            mem.borrow_mut().$method(addr, offset, ($from)(raw))?;
        }}}
        macro_rules! do_return { () => {{
            let Some(frame) = frames.pop() else { return Ok(()) };
            let from = stack.len() - frame.n_results;
            stack.drain(frame.locals_base..from);
            labels.truncate(frame.label_base);
            match frames.last() {
                Some(caller) => {
                    pc = frame.return_pc;
                    locals_base = caller.locals_base;
                    label_base = caller.label_base;
                }
                None => return Ok(()),
            }
        }} }
        macro_rules! branch { ($depth:expr) => {{
            if Self::branch(&mut pc, stack, labels, label_base, $depth) {
                do_return!();
            }
        }} }
        macro_rules! call_function { ($func_idx:expr) => {{
            match &self.functions[$func_idx] {
                &RuntimeFunction::OwnedWasm { n_params, n_results, pc_start, locals_count } => {
                    if frames.len() >= Self::MAX_CALL_DEPTH {
                        return Err(Error::trap(STACK_EXHAUSTED));
                    }
                    locals_base = stack.len() - n_params;
                    label_base = labels.len();
                    meter.charge_scaled(0, self.local_cost, locals_count)?;
                    stack.resize(stack.len() + locals_count, WasmValue::default());
                    frames.push(Frame { return_pc: pc, locals_base, label_base, n_results });
                    pc = pc_start;
                }
                RuntimeFunction::Host { callback, n_params, name, .. } => {
                    trace!(function = name.as_str(), "host call");
                    let callback = callback.clone();
                    let args = stack.split_off(stack.len() - n_params);
                    let mut caller = Caller::new(mem, meter, self.copy_cost);
                    if let Some(result) = callback(&mut caller, &args)? {
                        stack.push(result);
                    }
                }
            }
        }} }

        loop {
            meter.charge(self.instruction_cost)?;
            match next_op!() {
                0x00 => return Err(Error::trap(UNREACHABLE)),
                0x01 | 0xbc | 0xbd | 0xbe | 0xbf => {} // nop and reinterprets (no-op on raw bits)
                0x02 => { // block
                    let info = block_info!();
                    labels.push(Label {
                        stack_len: stack.len() - info.n_params as usize,
                        dest_pc: info.end_pc,
                        arity: info.n_results as usize,
                        is_loop: false,
                    });
                    pc = info.body_pc;
                }
                0x03 => { // loop
                    let info = block_info!();
                    labels.push(Label {
                        stack_len: stack.len() - info.n_params as usize,
                        dest_pc: info.body_pc,
                        arity: info.n_params as usize,
                        is_loop: true,
                    });
                    pc = info.body_pc;
                }
                0x04 => { // if
                    let info = block_info!();
                    let cond = pop_val!().as_u32();
                    let label = Label {
                        stack_len: stack.len() - info.n_params as usize,
                        dest_pc: info.end_pc,
                        arity: info.n_results as usize,
                        is_loop: false,
                    };
                    if cond != 0 {
                        labels.push(label);
                        pc = info.body_pc;
                    } else if let Some(else_pc) = info.else_pc {
                        labels.push(label);
                        pc = else_pc;
                    } else {
                        pc = info.end_pc;
                    }
                }
                0x05 => { // else: the then-arm finished, skip to the end
                    let label = labels.pop().ok_or(Error::malformed(ELSE_MUST_CLOSE_IF))?;
                    pc = label.dest_pc;
                }
                0x0b => { // end
                    if labels.len() == label_base {
                        do_return!();
                    } else {
                        labels.pop();
                    }
                }
                0x0c => { // br
                    let depth: u32 = read_leb128(bytes, &mut pc)?;
                    branch!(depth);
                }
                0x0d => { // br_if
                    let depth: u32 = read_leb128(bytes, &mut pc)?;
                    if pop_val!().as_u32() != 0 {
                        branch!(depth);
                    }
                }
                0x0e => { // br_table
                    let n_targets: u32 = read_leb128(bytes, &mut pc)?;
                    let idx = pop_val!().as_u32();
                    let mut depth = 0u32;
                    for i in 0..=n_targets {
                        let target: u32 = read_leb128(bytes, &mut pc)?;
                        if i == idx || i == n_targets {
                            depth = target;
                            break;
                        }
                    }
                    branch!(depth);
                }
                0x0f => { do_return!(); } // return
                0x10 => { // call
                    let func_idx: u32 = read_leb128(bytes, &mut pc)?;
                    call_function!(func_idx as usize);
                }
                0x11 => { // call_indirect
                    let type_idx: u32 = read_leb128(bytes, &mut pc)?;
                    pc += 1; // zero flag
                    let elem_idx = pop_val!().as_u32();
                    let func_idx = match self.table.get(elem_idx as usize) {
                        None => return Err(Error::trap(UNDEF_ELEM)),
                        Some(None) => return Err(Error::trap(UNINITIALIZED_ELEM)),
                        Some(Some(idx)) => *idx as usize,
                    };
                    if self.module.functions[func_idx].ty != self.module.types[type_idx as usize] {
                        return Err(Error::trap(INDIRECT_CALL_MISMATCH));
                    }
                    call_function!(func_idx);
                }
                // Parametric instructions
                0x1a => { pop_val!(); } // drop
                0x1b => { // select
                    let cond = pop_val!().as_u32();
                    let v2 = pop_val!();
                    let v1 = pop_val!();
                    stack.push(if cond != 0 { v1 } else { v2 });
                }
                // Variable instructions
                0x20 => { // local.get
                    let local: u32 = read_leb128(bytes, &mut pc)?;
                    let v = *stack.get(locals_base + local as usize).ok_or(Error::malformed(UNKNOWN_LOCAL))?;
                    stack.push(v);
                }
                0x21 => { // local.set
                    let local: u32 = read_leb128(bytes, &mut pc)?;
                    let v = pop_val!();
                    *stack.get_mut(locals_base + local as usize).ok_or(Error::malformed(UNKNOWN_LOCAL))? = v;
                }
                0x22 => { // local.tee
                    let local: u32 = read_leb128(bytes, &mut pc)?;
                    let v = *stack.last().ok_or(Error::trap(STACK_UNDERFLOW))?;
                    *stack.get_mut(locals_base + local as usize).ok_or(Error::malformed(UNKNOWN_LOCAL))? = v;
                }
                0x23 => { // global.get
                    let gi: u32 = read_leb128(bytes, &mut pc)?;
                    let global = self.globals.get(gi as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
                    stack.push(global.get());
                }
                0x24 => { // global.set
                    let gi: u32 = read_leb128(bytes, &mut pc)?;
                    let v = pop_val!();
                    self.globals.get(gi as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))?.set(v);
                }
                // Memory instructions - loads
                0x28 => { load!(load_u32, |v: u32| WasmValue::from_u32(v)); }
                0x29 => { load!(load_u64, |v: u64| WasmValue::from_u64(v)); }
                0x2a => { load!(load_f32, |v: f32| WasmValue::from_f32(v)); }
                0x2b => { load!(load_f64, |v: f64| WasmValue::from_f64(v)); }
                0x2c => { load!(load_i8,  |v: i8| WasmValue::from_i32(v as i32)); }
                0x2d => { load!(load_u8,  |v: u8| WasmValue::from_u32(v as u32)); }
                0x2e => { load!(load_i16, |v: i16| WasmValue::from_i32(v as i32)); }
                0x2f => { load!(load_u16, |v: u16| WasmValue::from_u32(v as u32)); }
                0x30 => { load!(load_i8,  |v: i8| WasmValue::from_i64(v as i64)); }
                0x31 => { load!(load_u8,  |v: u8| WasmValue::from_u64(v as u64)); }
                0x32 => { load!(load_i16, |v: i16| WasmValue::from_i64(v as i64)); }
                0x33 => { load!(load_u16, |v: u16| WasmValue::from_u64(v as u64)); }
                0x34 => { load!(load_i32, |v: i32| WasmValue::from_i64(v as i64)); }
                0x35 => { load!(load_u32, |v: u32| WasmValue::from_u64(v as u64)); }
                // Memory instructions - stores
                0x36 => { store!(store_u32, |w: WasmValue| w.as_u32()); }
                0x37 => { store!(store_u64, |w: WasmValue| w.as_u64()); }
                0x38 => { store!(store_f32, |w: WasmValue| w.as_f32()); }
                0x39 => { store!(store_f64, |w: WasmValue| w.as_f64()); }
                0x3a => { store!(store_u8,  |w: WasmValue| w.as_u32() as u8); }
                0x3b => { store!(store_u16, |w: WasmValue| w.as_u32() as u16); }
                0x3c => { store!(store_u8,  |w: WasmValue| w.as_u64() as u8); }
                0x3d => { store!(store_u16, |w: WasmValue| w.as_u64() as u16); }
                0x3e => { store!(store_u32, |w: WasmValue| w.as_u64() as u32); }
                // Memory instructions - size/grow
                0x3f => { // memory.size
                    pc += 1; // zero flag
                    let mem = mem.ok_or(Error::OutOfBounds)?;
                    stack.push(WasmValue::from_u32(mem.borrow().size()));
                }
                0x40 => { // memory.grow
                    pc += 1; // zero flag
                    let delta = pop_val!().as_u32();
                    let mem = mem.ok_or(Error::OutOfBounds)?;
                    let old = mem.borrow_mut().grow(delta).map(WasmValue::from_u32).unwrap_or(WasmValue::from_i32(-1));
                    stack.push(old);
                }
                // Numeric instructions - constants
                0x41 => { // i32.const
                    stack.push(WasmValue::from_i32(read_sleb128::<i32>(bytes, &mut pc)?));
                }
                0x42 => { // i64.const
                    stack.push(WasmValue::from_i64(read_sleb128::<i64>(bytes, &mut pc)?));
                }
                0x43 => { // f32.const
                    stack.push(WasmValue::from_f32_bits(u32::from_le_bytes(read_array(bytes, pc)?)));
                    pc += 4;
                }
                0x44 => { // f64.const
                    stack.push(WasmValue::from_f64_bits(u64::from_le_bytes(read_array(bytes, pc)?)));
                    pc += 8;
                }
                // Numeric instructions - i32 comparison
                0x45 => { unary!(u32, |x: u32| (x == 0) as u32); } // i32.eqz
                0x46 => { compare!(u32, ==); } // i32.eq
                0x47 => { compare!(u32, !=); } // i32.ne
                0x48 => { compare!(i32, <); } // i32.lt_s
                0x49 => { compare!(u32, <); } // i32.lt_u
                0x4a => { compare!(i32, >); } // i32.gt_s
                0x4b => { compare!(u32, >); } // i32.gt_u
                0x4c => { compare!(i32, <=); } // i32.le_s
                0x4d => { compare!(u32, <=); } // i32.le_u
                0x4e => { compare!(i32, >=); } // i32.ge_s
                0x4f => { compare!(u32, >=); } // i32.ge_u
                // Numeric instructions - i64 comparison
                0x50 => { // i64.eqz
                    let v = pop_val!().as_u64();
                    stack.push(WasmValue::from_u32((v == 0) as u32));
                }
                0x51 => { compare!(i64, ==); } // i64.eq
                0x52 => { compare!(i64, !=); } // i64.ne
                0x53 => { compare!(i64, <); } // i64.lt_s
                0x54 => { compare!(u64, <); } // i64.lt_u
                0x55 => { compare!(i64, >); } // i64.gt_s
                0x56 => { compare!(u64, >); } // i64.gt_u
                0x57 => { compare!(i64, <=); } // i64.le_s
                0x58 => { compare!(u64, <=); } // i64.le_u
                0x59 => { compare!(i64, >=); } // i64.ge_s
                0x5a => { compare!(u64, >=); } // i64.ge_u
                // Numeric instructions - f32 comparison
                0x5b => { compare!(f32, ==); } // f32.eq
                0x5c => { compare!(f32, !=); } // f32.ne
                0x5d => { compare!(f32, <); } // f32.lt
                0x5e => { compare!(f32, >); } // f32.gt
                0x5f => { compare!(f32, <=); } // f32.le
                0x60 => { compare!(f32, >=); } // f32.ge
                // Numeric instructions - f64 comparison
                0x61 => { compare!(f64, ==); } // f64.eq
                0x62 => { compare!(f64, !=); } // f64.ne
                0x63 => { compare!(f64, <); } // f64.lt
                0x64 => { compare!(f64, >); } // f64.gt
                0x65 => { compare!(f64, <=); } // f64.le
                0x66 => { compare!(f64, >=); } // f64.ge
                // Numeric instructions - i32 operations
                0x67 => { unary!(u32, |x: u32| x.leading_zeros()); } // i32.clz
                0x68 => { unary!(u32, |x: u32| x.trailing_zeros()); } // i32.ctz
                0x69 => { unary!(u32, |x: u32| x.count_ones()); } // i32.popcnt
                0x6a => { binary!(u32, .wrapping_add); } // i32.add
                0x6b => { binary!(u32, .wrapping_sub); } // i32.sub
                0x6c => { binary!(u32, .wrapping_mul); } // i32.mul
                0x6d => { div_s!(i32); } // i32.div_s
                0x6e => { div_u!(u32); } // i32.div_u
                0x6f => { rem_s!(i32); } // i32.rem_s
                0x70 => { rem_u!(u32); } // i32.rem_u
                0x71 => { binary!(u32, &); } // i32.and
                0x72 => { binary!(u32, |); } // i32.or
                0x73 => { binary!(u32, ^); } // i32.xor
                0x74 => { shift!(u32, <<); } // i32.shl
                0x75 => { shr_s!(i32, u32, 32); } // i32.shr_s
                0x76 => { shift!(u32, >>); } // i32.shr_u
                0x77 => { rotate!(u32, left); } // i32.rotl
                0x78 => { rotate!(u32, right); } // i32.rotr
                // Numeric instructions - i64 operations
                0x79 => { unary!(u64, |x: u64| x.leading_zeros() as u64); } // i64.clz
                0x7a => { unary!(u64, |x: u64| x.trailing_zeros() as u64); } // i64.ctz
                0x7b => { unary!(u64, |x: u64| x.count_ones() as u64); } // i64.popcnt
                0x7c => { binary!(u64, .wrapping_add); } // i64.add
                0x7d => { binary!(u64, .wrapping_sub); } // i64.sub
                0x7e => { binary!(u64, .wrapping_mul); } // i64.mul
                0x7f => { div_s!(i64); } // i64.div_s
                0x80 => { div_u!(u64); } // i64.div_u
                0x81 => { rem_s!(i64); } // i64.rem_s
                0x82 => { rem_u!(u64); } // i64.rem_u
                0x83 => { binary!(u64, &); } // i64.and
                0x84 => { binary!(u64, |); } // i64.or
                0x85 => { binary!(u64, ^); } // i64.xor
                0x86 => { shift!(u64, <<); } // i64.shl
                0x87 => { shr_s!(i64, u64, 64); } // i64.shr_s
                0x88 => { shift!(u64, >>); } // i64.shr_u
                0x89 => { rotate!(u64, left); } // i64.rotl
                0x8a => { rotate!(u64, right); } // i64.rotr
                // Numeric instructions - f32 operations
                0x8b => { unary!(f32, |x: f32| x.abs()); } // f32.abs
                0x8c => { unary!(f32, |x: f32| -x); } // f32.neg
                0x8d => { unary!(f32, |x: f32| x.ceil()); } // f32.ceil
                0x8e => { unary!(f32, |x: f32| x.floor()); } // f32.floor
                0x8f => { unary!(f32, |x: f32| x.trunc()); } // f32.trunc
                0x90 => { nearest!(f32); } // f32.nearest
                0x91 => { unary!(f32, |x: f32| x.sqrt()); } // f32.sqrt
                0x92 => { binary!(f32, +); } // f32.add
                0x93 => { binary!(f32, -); } // f32.sub
                0x94 => { binary!(f32, *); } // f32.mul
                0x95 => { binary!(f32, /); } // f32.div
                0x96 => { minmax!(f32, min); } // f32.min
                0x97 => { minmax!(f32, max); } // f32.max
                0x98 => { copysign!(f32); } // f32.copysign
                // Numeric instructions - f64 operations
                0x99 => { unary!(f64, |x: f64| x.abs()); } // f64.abs
                0x9a => { unary!(f64, |x: f64| -x); } // f64.neg
                0x9b => { unary!(f64, |x: f64| x.ceil()); } // f64.ceil
                0x9c => { unary!(f64, |x: f64| x.floor()); } // f64.floor
                0x9d => { unary!(f64, |x: f64| x.trunc()); } // f64.trunc
                0x9e => { nearest!(f64); } // f64.nearest
                0x9f => { unary!(f64, |x: f64| x.sqrt()); } // f64.sqrt
                0xa0 => { binary!(f64, +); } // f64.add
                0xa1 => { binary!(f64, -); } // f64.sub
                0xa2 => { binary!(f64, *); } // f64.mul
                0xa3 => { binary!(f64, /); } // f64.div
                0xa4 => { minmax!(f64, min); } // f64.min
                0xa5 => { minmax!(f64, max); } // f64.max
                0xa6 => { copysign!(f64); } // f64.copysign
                // Conversions and truncations
                0xa7 => { convert!(u64 -> u32); } // i32.wrap_i64
                0xa8 => { trunc!(f32 -> i32 : -2147483777.0, 2147483648.0); } // i32.trunc_f32_s
                0xa9 => { trunc!(f32 -> u32 : -1.0, 4294967296.0); } // i32.trunc_f32_u
                0xaa => { trunc!(f64 -> i32 : -2147483649.0, 2147483648.0); } // i32.trunc_f64_s
                0xab => { trunc!(f64 -> u32 : -1.0, 4294967296.0); } // i32.trunc_f64_u
                0xac => { convert!(i32 -> i64); } // i64.extend_i32_s
                0xad => { convert!(u32 -> u64); } // i64.extend_i32_u
                0xae => { trunc!(f32 -> i64 : -9223373136366404000.0, 9223372036854776000.0); } // i64.trunc_f32_s
                0xaf => { trunc!(f32 -> u64 : -1.0, 18446744073709552000.0); } // i64.trunc_f32_u
                0xb0 => { trunc!(f64 -> i64 : -9223372036854777856.0, 9223372036854776000.0); } // i64.trunc_f64_s
                0xb1 => { trunc!(f64 -> u64 : -1.0, 18446744073709552000.0); } // i64.trunc_f64_u
                // Float conversions from integers
                0xb2 => { convert!(i32 -> f32); } // f32.convert_i32_s
                0xb3 => { convert!(u32 -> f32); } // f32.convert_i32_u
                0xb4 => { convert!(i64 -> f32); } // f32.convert_i64_s
                0xb5 => { convert!(u64 -> f32); } // f32.convert_i64_u
                0xb6 => { convert!(f64 -> f32); } // f32.demote_f64
                0xb7 => { convert!(i32 -> f64); } // f64.convert_i32_s
                0xb8 => { convert!(u32 -> f64); } // f64.convert_i32_u
                0xb9 => { convert!(i64 -> f64); } // f64.convert_i64_s
                0xba => { convert!(u64 -> f64); } // f64.convert_i64_u
                0xbb => { convert!(f32 -> f64); } // f64.promote_f32
                // Sign extension
                0xc0 => { unary!(i32, |x: i32| x as i8 as i32); } // i32.extend8_s
                0xc1 => { unary!(i32, |x: i32| x as i16 as i32); } // i32.extend16_s
                0xc2 => { unary!(i64, |x: i64| x as i8 as i64); } // i64.extend8_s
                0xc3 => { unary!(i64, |x: i64| x as i16 as i64); } // i64.extend16_s
                0xc4 => { unary!(i64, |x: i64| x as i32 as i64); } // i64.extend32_s
                0xfc => {
                    let sub: u32 = read_leb128(bytes, &mut pc)?;
                    match sub {
                        0 => { convert!(f32 -> i32); } // i32.trunc_sat_f32_s
                        1 => { convert!(f32 -> u32); } // i32.trunc_sat_f32_u
                        2 => { convert!(f64 -> i32); } // i32.trunc_sat_f64_s
                        3 => { convert!(f64 -> u32); } // i32.trunc_sat_f64_u
                        4 => { convert!(f32 -> i64); } // i64.trunc_sat_f32_s
                        5 => { convert!(f32 -> u64); } // i64.trunc_sat_f32_u
                        6 => { convert!(f64 -> i64); } // i64.trunc_sat_f64_s
                        7 => { convert!(f64 -> u64); } // i64.trunc_sat_f64_u
                        10 => { // memory.copy
                            pc += 2;
                            let n = pop_val!().as_u32();
                            let src = pop_val!().as_u32();
                            let dst = pop_val!().as_u32();
                            meter.charge_scaled(0, self.copy_cost, n as usize)?;
                            let mem = mem.ok_or(Error::OutOfBounds)?;
                            let mut mem = mem.borrow_mut();
                            check_range(&mem, src, n)?;
                            check_range(&mem, dst, n)?;
                            let data = mem.read(src, n)?;
                            mem.write(dst, &data)?;
                        }
                        11 => { // memory.fill
                            pc += 1;
                            let n = pop_val!().as_u32();
                            let value = pop_val!().as_u32() as u8;
                            let dst = pop_val!().as_u32();
                            meter.charge_scaled(0, self.copy_cost, n as usize)?;
                            let mem = mem.ok_or(Error::OutOfBounds)?;
                            let mut mem = mem.borrow_mut();
                            check_range(&mem, dst, n)?;
                            mem.write(dst, &vec![value; n as usize])?;
                        }
                        _ => return Err(Error::malformed(UNKNOWN_INSTRUCTION)),
                    }
                }
                _ => {
                    return Err(Error::malformed(UNKNOWN_INSTRUCTION));
                }
            }
        }
    }

    /// Unwinds to the label `depth` levels out. Returns `true` when the
    /// target is the function body itself, i.e. the branch is a return.
    #[inline]
    fn branch(pc: &mut usize, stack: &mut Vec<WasmValue>, labels: &mut Vec<Label>, label_base: usize, depth: u32) -> bool {
        let depth = depth as usize;
        if depth >= labels.len() - label_base { return true; }
        let idx = labels.len() - 1 - depth;
        let target = labels[idx];
        let from = stack.len() - target.arity;
        if from > target.stack_len {
            stack.drain(target.stack_len..from);
        }
        labels.truncate(if target.is_loop { idx + 1 } else { idx });
        *pc = target.dest_pc;
        false
    }
}

fn read_array<const N: usize>(bytes: &[u8], pc: usize) -> Result<[u8; N], Error> {
    bytes.get(pc..pc + N)
        .and_then(|raw| <[u8; N]>::try_from(raw).ok())
        .ok_or(Error::malformed(UNEXPECTED_END))
}

fn check_range(mem: &WasmMemory, offset: u32, len: u32) -> Result<(), Error> {
    match (offset as usize).checked_add(len as usize) {
        Some(end) if end <= mem.byte_len() => Ok(()),
        _ => Err(Error::OutOfBounds),
    }
}
