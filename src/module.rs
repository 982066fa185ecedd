use std::collections::HashMap;
use std::rc::Rc;

use nohash_hasher::IntMap;
use tracing::debug;

use crate::byte_iter::*;
use crate::config::EngineConfig;
use crate::error::*;
use crate::host;
use crate::leb128::*;
use crate::signature::*;
use crate::validator::Validator;

/// Shared, immutable handle to a validated module.
pub type ModuleHandle = Rc<Module>;

pub const MAGIC_HEADER: &[u8; 4] = b"\0asm";
pub const HOST_MODULE: &str = "env";

// ---------------- Import/Export related ----------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRef { pub module: String, pub field: String }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Mem),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }
}

// ---------------- Structures ----------------
#[derive(Clone, Debug)]
pub struct Function {
    pub body: std::ops::Range<usize>,
    pub ty: Signature,
    /// Parameters followed by declared locals.
    pub locals: Vec<ValType>,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Table {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Memory {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Global {
    pub ty: ValType,
    pub is_mutable: bool,
    pub initializer_offset: usize,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Copy, Debug)]
pub struct Export { pub kind: ExternKind, pub idx: u32 }

#[derive(Clone, Debug)]
pub struct ElementSegment { pub initializer_offset: usize, pub func_indices: Vec<u32> }

#[derive(Clone, Debug)]
pub struct DataSegment { pub data_range: std::ops::Range<usize>, pub initializer_offset: usize }

/// Branch targets of one structured control instruction, keyed in the
/// side table by the offset of its block type immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// First instruction inside the block.
    pub body_pc: usize,
    /// Instruction following the matching `end`.
    pub end_pc: usize,
    /// Instruction following `else`, for `if` blocks that have one.
    pub else_pc: Option<usize>,
    pub n_params: u32,
    pub n_results: u32,
}

// ---------------- Module Structure ----------------
pub struct Module {
    pub bytes: Rc<Vec<u8>>,
    pub types: Vec<Signature>,
    pub imports: Vec<(ImportRef, ExternKind)>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub globals: Vec<Global>,
    pub exports: HashMap<String, Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub functions: Vec<Function>,
    pub data_segments: Vec<DataSegment>,
    pub side_table: IntMap<usize, BlockInfo>,
}

impl Module {
    pub const MAX_PAGES: u32 = 65536;
    pub const MAX_LOCALS: usize = 50000;

    /// Decodes and validates `bytes` without resolving imports.
    pub fn compile(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Module {
            bytes: Rc::new(bytes),
            types: Vec::new(),
            imports: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            exports: HashMap::new(),
            start: None,
            elements: Vec::new(),
            functions: Vec::new(),
            data_segments: Vec::new(),
            side_table: IntMap::default(),
        };
        m.initialize()?;
        Ok(m)
    }

    /// Decodes, validates and links `bytes` against the host function
    /// table, enforcing the engine's entry point and size limits.
    pub fn load(bytes: Vec<u8>, config: &EngineConfig) -> Result<ModuleHandle, Error> {
        let module = Self::compile(bytes)?;
        module.resolve_imports()?;
        module.check_entry_points()?;
        if let Some(memory) = &module.memory {
            if memory.min > config.max_memory_pages {
                return Err(Error::MemoryLimitExceeded);
            }
        }
        if let Some(table) = &module.table {
            if table.min > config.max_table_elements {
                return Err(Error::MemoryLimitExceeded);
            }
        }
        debug!(
            size = module.bytes.len(),
            functions = module.functions.len(),
            exports = module.exports.len(),
            "module loaded"
        );
        Ok(Rc::new(module))
    }

    /// Names of the exported entry points, sorted.
    pub fn entry_points(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.iter()
            .filter(|(_, ex)| ex.kind == ExternKind::Func)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        matches!(self.exports.get(name), Some(Export { kind: ExternKind::Func, .. }))
    }

    fn resolve_imports(&self) -> Result<(), Error> {
        for (import, kind) in &self.imports {
            let unresolved = || Error::UnresolvedImport { module: import.module.clone(), field: import.field.clone() };
            if *kind != ExternKind::Func || import.module != HOST_MODULE {
                return Err(unresolved());
            }
            let spec = host::lookup(&import.field).ok_or_else(unresolved)?;
            let declared = self.functions.iter()
                .find(|f| f.import.as_ref() == Some(import))
                .map(|f| &f.ty)
                .ok_or_else(unresolved)?;
            if *declared != spec.signature() {
                return Err(unresolved());
            }
        }
        Ok(())
    }

    fn check_entry_points(&self) -> Result<(), Error> {
        for export in self.exports.values().filter(|ex| ex.kind == ExternKind::Func) {
            let ty = &self.functions[export.idx as usize].ty;
            if ty.n_params() != 0 || ty.n_results() != 0 {
                return Err(Error::malformed(ENTRY_POINT_TYPE));
            }
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes_rc = self.bytes.clone();
        let bytes: &[u8] = &bytes_rc[..];

        if bytes.len() < 4 { return Err(Error::malformed(UNEXPECTED_END)); }
        if &bytes[0..4] != MAGIC_HEADER {
            return Err(Error::malformed(NO_MAGIC_HEADER));
        }
        if bytes.len() < 8 { return Err(Error::malformed(UNEXPECTED_END)); }
        if bytes[4..8] != [1, 0, 0, 0] {
            return Err(Error::malformed(UNKNOWN_BINARY_VERSION));
        }

        let mut it = ByteIter::new(bytes, 8);
        let mut last_id = 0u8;
        let mut n_declared: Option<usize> = None;
        let mut code_seen = false;
        while !it.empty() {
            let id = it.read_u8()?;
            let size = it.read_u32()? as usize;
            let start = it.cur();
            if !it.has_n_left(size) { return Err(Error::malformed(UNEXPECTED_END_SHORT)); }
            let end = start + size;
            // Reads are confined to the section so overruns surface as errors.
            let mut section = ByteIter::new(&bytes[..end], start);
            match id {
                0 => {
                    section.read_name()?;
                    section.idx = end;
                }
                1..=11 => {
                    if id <= last_id { return Err(Error::malformed(SECTION_OUT_OF_ORDER)); }
                    last_id = id;
                    match id {
                        1 => self.parse_type_section(&mut section)?,
                        2 => self.parse_import_section(&mut section)?,
                        3 => n_declared = Some(self.parse_function_section(&mut section)?),
                        4 => self.parse_table_section(&mut section)?,
                        5 => self.parse_memory_section(&mut section)?,
                        6 => self.parse_global_section(&mut section)?,
                        7 => self.parse_export_section(&mut section)?,
                        8 => self.parse_start_section(&mut section)?,
                        9 => self.parse_element_section(&mut section)?,
                        10 => {
                            code_seen = true;
                            self.parse_code_section(&mut section)?
                        }
                        _ => self.parse_data_section(&mut section)?,
                    }
                }
                _ => return Err(Error::malformed(INVALID_SECTION_ID)),
            }
            if section.cur() != end { return Err(Error::malformed(SECTION_SIZE_MISMATCH)); }
            it.idx = end;
        }

        if !code_seen && n_declared.unwrap_or(0) > 0 {
            return Err(Error::malformed(FUNC_CODE_INCONSISTENT));
        }
        Ok(())
    }

    fn parse_type_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_types = it.read_u32()?;
        for _ in 0..n_types {
            if it.read_u8()? != 0x60 {
                return Err(Error::malformed(INVALID_VALUE_TYPE));
            }
            let mut sig = Signature::default();
            let n_params = it.read_u32()?;
            for _ in 0..n_params {
                let ty = val_type_from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_VALUE_TYPE))?;
                sig.params.push(ty);
            }
            let n_results = it.read_u32()?;
            if n_results > 1 {
                return Err(Error::malformed(INVALID_RESULT_ARITY));
            }
            for _ in 0..n_results {
                let ty = val_type_from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_RESULT_TYPE))?;
                sig.results.push(ty);
            }
            self.types.push(sig);
        }
        Ok(())
    }

    fn parse_import_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_imports = it.read_u32()?;
        for _ in 0..n_imports {
            let module = it.read_name()?;
            let field = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::malformed(MALFORMED_IMPORT_KIND))?;
            let import = ImportRef { module, field };
            self.imports.push((import.clone(), kind));

            match kind {
                ExternKind::Func => {
                    let type_idx = it.read_u32()? as usize;
                    let ty = self.types.get(type_idx).cloned().ok_or(Error::malformed(UNKNOWN_TYPE))?;
                    self.functions.push(Function { body: 0..0, ty, locals: vec![], import: Some(import) });
                }
                ExternKind::Table => {
                    if self.table.is_some() {
                        return Err(Error::malformed(MULTIPLE_TABLES));
                    }
                    if it.read_u8()? != 0x70 {
                        return Err(Error::malformed(MALFORMED_REF_TYPE));
                    }
                    let (min, max) = get_limits(it, u32::MAX)?;
                    self.table = Some(Table { min, max, import: Some(import) });
                }
                ExternKind::Mem => {
                    if self.memory.is_some() {
                        return Err(Error::malformed(MULTIPLE_MEMORIES));
                    }
                    let (min, max) = get_memory_limits(it)?;
                    self.memory = Some(Memory { min, max, import: Some(import) });
                }
                ExternKind::Global => {
                    let ty = val_type_from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_GLOBAL_TYPE))?;
                    let is_mutable = mutability_from_byte(it.read_u8()?)?;
                    self.globals.push(Global { ty, is_mutable, initializer_offset: 0, import: Some(import) });
                }
            }
        }
        Ok(())
    }

    fn parse_function_section(&mut self, it: &mut ByteIter) -> Result<usize, Error> {
        let n_functions = it.read_u32()?;
        for _ in 0..n_functions {
            let type_idx = it.read_u32()? as usize;
            let ty = self.types.get(type_idx).cloned().ok_or(Error::malformed(UNKNOWN_TYPE))?;
            self.functions.push(Function { body: 0..0, ty, locals: vec![], import: None });
        }
        Ok(n_functions as usize)
    }

    fn parse_table_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tables = it.read_u32()?;
        if n_tables > 1 || (n_tables == 1 && self.table.is_some()) {
            return Err(Error::malformed(MULTIPLE_TABLES));
        }
        if n_tables == 1 {
            if it.read_u8()? != 0x70 {
                return Err(Error::malformed(INVALID_ELEM_TYPE));
            }
            let (min, max) = get_limits(it, u32::MAX)?;
            self.table = Some(Table { min, max, import: None });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_memories = it.read_u32()?;
        if n_memories > 1 || (n_memories == 1 && self.memory.is_some()) {
            return Err(Error::malformed(MULTIPLE_MEMORIES));
        }
        if n_memories == 1 {
            let (min, max) = get_memory_limits(it)?;
            self.memory = Some(Memory { min, max, import: None });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_globals = it.read_u32()?;
        for _ in 0..n_globals {
            let ty = val_type_from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_GLOBAL_TYPE))?;
            let is_mutable = mutability_from_byte(it.read_u8()?)?;
            let initializer_offset = it.cur();
            self.validate_const(it, ty)?;
            self.globals.push(Global { ty, is_mutable, initializer_offset, import: None });
        }
        Ok(())
    }

    fn parse_export_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_exports = it.read_u32()?;
        for _ in 0..n_exports {
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_EXPORT_DESC))?;
            let idx = it.read_u32()?;

            if self.exports.contains_key(&name) {
                return Err(Error::malformed(DUP_EXPORT_NAME));
            }
            match kind {
                ExternKind::Func if (idx as usize) >= self.functions.len() => {
                    return Err(Error::malformed(UNKNOWN_FUNC));
                }
                ExternKind::Table if idx != 0 || self.table.is_none() => {
                    return Err(Error::malformed(UNKNOWN_TABLE));
                }
                ExternKind::Mem if idx != 0 || self.memory.is_none() => {
                    return Err(Error::malformed(UNKNOWN_MEMORY));
                }
                ExternKind::Global if (idx as usize) >= self.globals.len() => {
                    return Err(Error::malformed(UNKNOWN_GLOBAL));
                }
                _ => {}
            }
            self.exports.insert(name, Export { kind, idx });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let start = it.read_u32()?;
        let function = self.functions.get(start as usize).ok_or(Error::malformed(UNKNOWN_FUNC))?;
        if function.ty.n_params() != 0 || function.ty.n_results() != 0 {
            return Err(Error::malformed(START_FUNC));
        }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            let flags = it.read_u32()?;
            if flags != 0 {
                return Err(Error::malformed(INVALID_ELEM_SEG_FLAG));
            }
            if self.table.is_none() {
                return Err(Error::malformed(UNKNOWN_TABLE));
            }
            let initializer_offset = it.cur();
            self.validate_const(it, ValType::I32)?;
            let n = it.read_u32()?;
            let mut func_indices = Vec::with_capacity(n.min(1024) as usize);
            for _ in 0..n {
                let func_idx = it.read_u32()?;
                if (func_idx as usize) >= self.functions.len() {
                    return Err(Error::malformed(UNKNOWN_FUNC));
                }
                func_indices.push(func_idx);
            }
            self.elements.push(ElementSegment { initializer_offset, func_indices });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_bodies = it.read_u32()? as usize;
        let n_imports = self.functions.iter().filter(|f| f.import.is_some()).count();
        if n_bodies + n_imports != self.functions.len() {
            return Err(Error::malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in n_imports..self.functions.len() {
            let body_size = it.read_u32()? as usize;
            let func_start = it.cur();
            if !it.has_n_left(body_size) { return Err(Error::malformed(UNEXPECTED_END)); }
            let func_end = func_start + body_size;

            let mut locals = self.functions[i].ty.params.clone();
            let n_local_decls = it.read_u32()?;
            for _ in 0..n_local_decls {
                let n_locals = it.read_u32()? as usize;
                let ty = val_type_from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_LOCAL_TYPE))?;
                if locals.len() + n_locals > Module::MAX_LOCALS {
                    return Err(Error::malformed(TOO_MANY_LOCALS));
                }
                locals.resize(locals.len() + n_locals, ty);
            }
            if it.cur() > func_end { return Err(Error::malformed(SECTION_SIZE_MISMATCH)); }

            let function = &mut self.functions[i];
            function.locals = locals;
            function.body = it.cur()..func_end;

            Validator::new(self).validate_function(i)?;
            it.idx = func_end;
        }
        Ok(())
    }

    fn parse_data_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            let flag = it.read_u32()?;
            if flag != 0 {
                return Err(Error::malformed(INVALID_DATA_SEG_FLAG));
            }
            if self.memory.is_none() {
                return Err(Error::malformed(UNKNOWN_MEMORY));
            }
            let initializer_offset = it.cur();
            self.validate_const(it, ValType::I32)?;

            let data_length = it.read_u32()? as usize;
            if !it.has_n_left(data_length) {
                return Err(Error::malformed(UNEXPECTED_END));
            }
            let data_start = it.cur();
            it.advance(data_length);
            self.data_segments.push(DataSegment { data_range: data_start..it.cur(), initializer_offset });
        }
        Ok(())
    }

    /// Checks a constant initializer expression of type `expected`.
    /// Only imported immutable globals may be read.
    fn validate_const(&self, it: &mut ByteIter, expected: ValType) -> Result<(), Error> {
        let op = it.read_u8()?;
        let actual = match op {
            0x41 => { let _: i32 = safe_read_sleb128(it.bytes, &mut it.idx, 32)?; ValType::I32 }
            0x42 => { let _: i64 = safe_read_sleb128(it.bytes, &mut it.idx, 64)?; ValType::I64 }
            0x43 => { it.slice_from(it.cur(), 4)?; it.advance(4); ValType::F32 }
            0x44 => { it.slice_from(it.cur(), 8)?; it.advance(8); ValType::F64 }
            0x23 => {
                let idx = it.read_u32()? as usize;
                let global = self.globals.get(idx).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
                if global.import.is_none() || global.is_mutable {
                    return Err(Error::malformed(CONST_EXP_REQUIRED));
                }
                global.ty
            }
            _ => return Err(Error::malformed(CONST_EXP_REQUIRED)),
        };
        if it.read_u8()? != 0x0b {
            return Err(Error::malformed(CONST_EXP_REQUIRED));
        }
        if actual != expected {
            return Err(Error::malformed(TYPE_MISMATCH));
        }
        Ok(())
    }
}

// ---------------- Helper Functions ----------------
fn mutability_from_byte(byte: u8) -> Result<bool, Error> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::malformed(INVALID_MUTABILITY)),
    }
}

fn get_limits(it: &mut ByteIter, upper: u32) -> Result<(u32, u32), Error> {
    let flags: u32 = safe_read_leb128(it.bytes, &mut it.idx, 1)?;
    let initial = it.read_u32()?;
    let max = if flags == 1 { it.read_u32()? } else { upper };
    if max < initial { return Err(Error::malformed(MIN_GREATER_THAN_MAX)); }
    Ok((initial, max))
}

fn get_memory_limits(it: &mut ByteIter) -> Result<(u32, u32), Error> {
    let (initial, max) = get_limits(it, Module::MAX_PAGES)?;
    if initial > Module::MAX_PAGES || max > Module::MAX_PAGES {
        return Err(Error::malformed(MEMORY_SIZE_LIMIT));
    }
    Ok((initial, max))
}
