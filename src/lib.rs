#![deny(unsafe_code)]

pub mod address;
pub mod byte_iter;
pub mod call_data;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod gas;
pub mod host;
pub mod instance;
pub mod leb128;
pub mod module;
pub mod registry;
pub mod signature;
pub mod validator;
pub mod wasm_memory;

pub use address::ContractAddress;
pub use call_data::CallData;
pub use config::{ConfigError, EngineConfig};
pub use engine::{CallInput, Engine, ExecutionOutcome, Failure, InvocationStatus};
pub use error::{Error, ErrorKind};
pub use gas::{GasMeter, GasSchedule};
pub use module::{Module, ModuleHandle};
pub use registry::{ContractRegistry, StorageScope};

// Per-instruction diagnostics, compiled in only with the wasm_debug feature
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;
