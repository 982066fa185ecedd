use crate::address::ContractAddress;

/// Every failure the engine can surface, from module loading through
/// contract execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The binary violates the module format or fails validation.
    #[error("malformed module: {0}")]
    MalformedModule(&'static str),
    /// An import does not match any entry of the host function table.
    #[error("unresolved import {module}.{field}")]
    UnresolvedImport { module: String, field: String },
    /// A memory access fell outside the instance's linear memory.
    #[error("out of bounds memory access")]
    OutOfBounds,
    /// Memory would grow beyond the configured maximum.
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    /// An argument index past the end of the argument list.
    #[error("argument index {0} out of range")]
    IndexOutOfRange(u32),
    /// The gas meter could not pay for the next step.
    #[error("out of resources")]
    OutOfResources,
    /// An async call would nest deeper than the configured limit.
    #[error("call depth exceeded")]
    CallDepthExceeded,
    /// No contract is deployed at the address.
    #[error("no contract at {0}")]
    NotFound(ContractAddress),
    /// The contract called `signalError`.
    #[error("signaled error: {0}")]
    SignaledError(String),
    /// A wasm trap raised by the interpreter.
    #[error("trap: {0}")]
    Trap(&'static str),
    /// Only the owner of a contract may upgrade it.
    #[error("sender is not the contract owner")]
    NotOwner,
    /// An async call payload that does not follow `function@hex@hex`.
    #[error("invalid call data: {0}")]
    InvalidCallData(&'static str),
    /// The module has no exported function with this name.
    #[error("entry point {0} not found")]
    EntryPointNotFound(String),
}

/// Fieldless discriminant of [`Error`], reported in structured failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    MalformedModule,
    UnresolvedImport,
    OutOfBounds,
    MemoryLimitExceeded,
    IndexOutOfRange,
    OutOfResources,
    CallDepthExceeded,
    NotFound,
    SignaledError,
    Trap,
    NotOwner,
    InvalidCallData,
    EntryPointNotFound,
}

impl ErrorKind {
    /// Numeric code a `callBack` receives for an async call that failed
    /// this way. 0 is reserved for success.
    pub fn return_code(self) -> u8 {
        match self {
            ErrorKind::EntryPointNotFound => 1,
            ErrorKind::InvalidCallData => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::SignaledError | ErrorKind::NotOwner => 4,
            ErrorKind::OutOfResources => 5,
            ErrorKind::CallDepthExceeded => 8,
            ErrorKind::MalformedModule | ErrorKind::UnresolvedImport => 9,
            ErrorKind::OutOfBounds | ErrorKind::MemoryLimitExceeded | ErrorKind::IndexOutOfRange | ErrorKind::Trap => 10,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedModule(_) => ErrorKind::MalformedModule,
            Error::UnresolvedImport { .. } => ErrorKind::UnresolvedImport,
            Error::OutOfBounds => ErrorKind::OutOfBounds,
            Error::MemoryLimitExceeded => ErrorKind::MemoryLimitExceeded,
            Error::IndexOutOfRange(_) => ErrorKind::IndexOutOfRange,
            Error::OutOfResources => ErrorKind::OutOfResources,
            Error::CallDepthExceeded => ErrorKind::CallDepthExceeded,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::SignaledError(_) => ErrorKind::SignaledError,
            Error::Trap(_) => ErrorKind::Trap,
            Error::NotOwner => ErrorKind::NotOwner,
            Error::InvalidCallData(_) => ErrorKind::InvalidCallData,
            Error::EntryPointNotFound(_) => ErrorKind::EntryPointNotFound,
        }
    }

    /// The bare diagnostic, without the kind prefix of `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::MalformedModule(s) | Error::Trap(s) | Error::InvalidCallData(s) => (*s).to_string(),
            Error::SignaledError(s) => s.clone(),
            other => other.to_string(),
        }
    }

    #[inline(always)]
    pub(crate) fn malformed(msg: &'static str) -> Self { Error::MalformedModule(msg) }
    #[inline(always)]
    pub(crate) fn trap(msg: &'static str) -> Self { Error::Trap(msg) }
}

// Decoding and validation
pub const FUNC_CODE_INCONSISTENT: &str = "function and code section have inconsistent lengths";
pub const INT_TOO_LARGE: &str = "integer too large";
pub const INT_TOO_LONG: &str = "integer representation too long";
pub const INVALID_GLOBAL_TYPE: &str = "invalid global type";
pub const INVALID_MUTABILITY: &str = "invalid mutability";
pub const INVALID_SECTION_ID: &str = "invalid section id";
pub const INVALID_UTF8: &str = "invalid UTF-8 encoding";
pub const INVALID_VALUE_TYPE: &str = "invalid value type";
pub const NO_MAGIC_HEADER: &str = "magic header not detected";
pub const MALFORMED_IMPORT_KIND: &str = "malformed import kind";
pub const MALFORMED_REF_TYPE: &str = "malformed reference type";
pub const SECTION_OUT_OF_ORDER: &str = "unexpected section order";
pub const SECTION_SIZE_MISMATCH: &str = "section size mismatch";
pub const TOO_MANY_LOCALS: &str = "too many locals";
pub const UNEXPECTED_END: &str = "unexpected end of section or function";
pub const UNEXPECTED_END_SHORT: &str = "unexpected end";
pub const UNKNOWN_BINARY_VERSION: &str = "unknown binary version";
pub const UNKNOWN_INSTRUCTION: &str = "unknown instruction";
pub const ZERO_FLAG_EXPECTED: &str = "zero flag expected";
pub const ALIGNMENT_TOO_LARGE: &str = "alignment must not be larger than natural";
pub const CONST_EXP_REQUIRED: &str = "constant expression required";
pub const DUP_EXPORT_NAME: &str = "duplicate export name";
pub const ELSE_MUST_CLOSE_IF: &str = "else must close an if";
pub const ENTRY_POINT_TYPE: &str = "exported entry point must take no parameters and return nothing";
pub const GLOBAL_IS_IMMUTABLE: &str = "global is immutable";
pub const INVALID_DATA_SEG_FLAG: &str = "invalid data segment flag";
pub const INVALID_ELEM_SEG_FLAG: &str = "invalid elements segment flag";
pub const INVALID_ELEM_TYPE: &str = "invalid table element type";
pub const INVALID_EXPORT_DESC: &str = "invalid export description";
pub const INVALID_LOCAL_TYPE: &str = "invalid local type";
pub const INVALID_RESULT_ARITY: &str = "invalid result arity";
pub const INVALID_RESULT_TYPE: &str = "invalid result type";
pub const MEMORY_SIZE_LIMIT: &str = "memory size must be at most 65536 pages (4GiB)";
pub const MIN_GREATER_THAN_MAX: &str = "size minimum must not be greater than maximum";
pub const MULTIPLE_MEMORIES: &str = "multiple memories";
pub const MULTIPLE_TABLES: &str = "multiple tables";
pub const START_FUNC: &str = "start function";
pub const TYPE_MISMATCH: &str = "type mismatch";
pub const UNKNOWN_FUNC: &str = "unknown function";
pub const UNKNOWN_GLOBAL: &str = "unknown global";
pub const UNKNOWN_LABEL: &str = "unknown label";
pub const UNKNOWN_LOCAL: &str = "unknown local";
pub const UNKNOWN_MEMORY: &str = "unknown memory";
pub const UNKNOWN_TABLE: &str = "unknown table";
pub const UNKNOWN_TYPE: &str = "unknown type";
// Traps
pub const DIVIDE_BY_ZERO: &str = "integer divide by zero";
pub const INDIRECT_CALL_MISMATCH: &str = "indirect call type mismatch";
pub const INTEGER_OVERFLOW: &str = "integer overflow";
pub const INVALID_CONV_TO_INT: &str = "invalid conversion to integer";
pub const STACK_EXHAUSTED: &str = "call stack exhausted";
pub const STACK_UNDERFLOW: &str = "stack underflow";
pub const UNDEF_ELEM: &str = "undefined element";
pub const UNINITIALIZED_ELEM: &str = "uninitialized element";
pub const UNREACHABLE: &str = "unreachable";
// Host interface
pub const RESULT_SEALED: &str = "result buffer is sealed";
// Instantiation
pub const DATA_SEG_DNF: &str = "data segment does not fit";
pub const ELEM_SEG_DNF: &str = "elements segment does not fit";
