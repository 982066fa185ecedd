//! The fixed set of functions a contract may import from `env`.
//!
//! [`HOST_FUNCTIONS`] describes every entry by name and signature and is
//! what the loader resolves imports against. [`imports`] binds the same
//! entries to one invocation's context and the registry.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::address::ContractAddress;
use crate::config::EngineConfig;
use crate::context::{AsyncCallRequest, CallContext, StagedDeployment, Value};
use crate::error::Error;
use crate::instance::{Caller, HostFunction, HostFunctions, WasmValue};
use crate::module::Module;
use crate::registry::ContractRegistry;
use crate::signature::{Signature, ValType};

/// Length of storage keys, addresses and values.
pub const WORD: u32 = 32;
/// Status returned by `getArgument`/`getArgumentLength` for a bad index.
pub const INDEX_OUT_OF_RANGE: i32 = -1;
pub const CREATE_OK: i32 = 0;
pub const CREATE_FAILED: i32 = 1;

pub struct HostFunctionSpec {
    pub name: &'static str,
    pub params: &'static [ValType],
    pub results: &'static [ValType],
}

impl HostFunctionSpec {
    pub fn signature(&self) -> Signature {
        Signature::new(self.params, self.results)
    }
}

const I32: ValType = ValType::I32;
const I64: ValType = ValType::I64;

macro_rules! host_spec {
    ($name:literal, [$($p:expr),*] -> [$($r:expr),*]) => {
        HostFunctionSpec { name: $name, params: &[$($p),*], results: &[$($r),*] }
    };
}

pub const HOST_FUNCTIONS: &[HostFunctionSpec] = &[
    host_spec!("getNumArguments", [] -> [I32]),
    host_spec!("getArgumentLength", [I32] -> [I32]),
    host_spec!("getArgument", [I32, I32] -> [I32]),
    host_spec!("storageStore", [I32, I32, I32] -> [I32]),
    host_spec!("storageLoad", [I32, I32] -> [I32]),
    host_spec!("storageLoadLength", [I32] -> [I32]),
    host_spec!("createContract", [I32, I32, I32, I32, I32, I32, I32] -> [I32]),
    host_spec!("asyncCall", [I32, I32, I32, I32] -> []),
    host_spec!("finish", [I32, I32] -> []),
    host_spec!("int64finish", [I64] -> []),
    host_spec!("signalError", [I32, I32] -> []),
    host_spec!("getCaller", [I32] -> []),
    host_spec!("getSCAddress", [I32] -> []),
    host_spec!("getCallValue", [I32] -> []),
];

pub fn lookup(name: &str) -> Option<&'static HostFunctionSpec> {
    HOST_FUNCTIONS.iter().find(|spec| spec.name == name)
}

/// Shared state the host closures of one invocation operate on.
#[derive(Clone)]
pub struct HostEnv {
    pub context: Rc<RefCell<CallContext>>,
    pub registry: Rc<RefCell<ContractRegistry>>,
    pub config: Rc<EngineConfig>,
}

impl HostEnv {
    /// Current value of `key`: staged writes first, then committed storage.
    fn current_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        let ctx = self.context.borrow();
        match ctx.staged(key) {
            Some([]) => None,
            Some(staged) => Some(staged.to_vec()),
            None => self.registry.borrow().storage_scope(&ctx.address).get(key).map(<[u8]>::to_vec),
        }
    }
}

fn i32_arg(args: &[WasmValue], idx: usize) -> i32 {
    args.get(idx).map_or(0, |v| v.as_i32())
}

fn ptr_arg(args: &[WasmValue], idx: usize) -> u32 {
    args.get(idx).map_or(0, |v| v.as_u32())
}

fn read_word(caller: &mut Caller<'_>, ptr: u32) -> Result<[u8; 32], Error> {
    let raw = caller.read(ptr, WORD)?;
    <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| Error::OutOfBounds)
}

/// Lengths are signed in the ABI; negative ones can never be in bounds.
fn length_arg(args: &[WasmValue], idx: usize) -> Result<u32, Error> {
    u32::try_from(i32_arg(args, idx)).map_err(|_| Error::OutOfBounds)
}

type HostBody = dyn Fn(&HostEnv, &mut Caller<'_>, &[WasmValue]) -> Result<Option<WasmValue>, Error>;

/// Wraps `body` so every call first pays the flat host-call cost.
fn register<F>(map: &mut HostFunctions, env: &HostEnv, name: &'static str, body: F)
where F: Fn(&HostEnv, &mut Caller<'_>, &[WasmValue]) -> Result<Option<WasmValue>, Error> + 'static {
    let Some(spec) = lookup(name) else { return };
    let env = env.clone();
    let host_call = env.config.schedule.host_call;
    let body: Rc<HostBody> = Rc::new(body);
    map.insert(name.to_string(), HostFunction {
        signature: spec.signature(),
        callback: Rc::new(move |caller: &mut Caller<'_>, args: &[WasmValue]| {
            caller.charge(host_call)?;
            body(&env, caller, args)
        }),
    });
}

/// Binds every host function to `env`.
pub fn imports(env: &HostEnv) -> HostFunctions {
    let mut map = HostFunctions::with_capacity(HOST_FUNCTIONS.len());

    register(&mut map, env, "getNumArguments", |env, _, _| {
        let n = env.context.borrow().arguments().len();
        Ok(Some(WasmValue::from_i32(n as i32)))
    });

    register(&mut map, env, "getArgumentLength", |env, _, args| {
        let len = env.context.borrow().argument(i32_arg(args, 0)).map_or(INDEX_OUT_OF_RANGE, |a| a.len() as i32);
        Ok(Some(WasmValue::from_i32(len)))
    });

    register(&mut map, env, "getArgument", |env, caller, args| {
        let arg = match env.context.borrow().argument(i32_arg(args, 0)) {
            Ok(arg) => arg.to_vec(),
            Err(err) => {
                trace!(%err, "argument status");
                return Ok(Some(WasmValue::from_i32(INDEX_OUT_OF_RANGE)));
            }
        };
        caller.write(ptr_arg(args, 1), &arg)?;
        Ok(Some(WasmValue::from_i32(arg.len() as i32)))
    });

    register(&mut map, env, "storageStore", |env, caller, args| {
        let key = caller.read(ptr_arg(args, 0), WORD)?;
        let data = caller.read(ptr_arg(args, 1), length_arg(args, 2)?)?;
        let schedule = &env.config.schedule;
        caller.charge(schedule.storage_store.saturating_add(schedule.storage_store_per_byte.saturating_mul(data.len() as u64)))?;
        let current = env.current_value(&key);
        let status = env.context.borrow_mut().stage_store(key, data, current.as_deref());
        trace!(?status, "storage store");
        Ok(Some(WasmValue::from_i32(status as i32)))
    });

    register(&mut map, env, "storageLoad", |env, caller, args| {
        let key = caller.read(ptr_arg(args, 0), WORD)?;
        caller.charge(env.config.schedule.storage_load)?;
        let value = env.current_value(&key).unwrap_or_default();
        caller.write(ptr_arg(args, 1), &value)?;
        Ok(Some(WasmValue::from_i32(value.len() as i32)))
    });

    register(&mut map, env, "storageLoadLength", |env, caller, args| {
        let key = caller.read(ptr_arg(args, 0), WORD)?;
        caller.charge(env.config.schedule.storage_load)?;
        let len = env.current_value(&key).map_or(0, |v| v.len());
        Ok(Some(WasmValue::from_i32(len as i32)))
    });

    register(&mut map, env, "createContract", |env, caller, args| {
        // The value is never transferred, only bounds-checked.
        read_word(caller, ptr_arg(args, 0))?;
        let code_len = length_arg(args, 2)?;
        let schedule = &env.config.schedule;
        caller.charge(schedule.create_contract.saturating_add(schedule.create_contract_per_byte.saturating_mul(code_len as u64)))?;
        let code = caller.read(ptr_arg(args, 1), code_len)?;

        // Constructor arguments are bounds-checked; the child's `init` is
        // not run for contract-created deployments.
        let num_args = length_arg(args, 4)?;
        let lens_size = num_args.checked_mul(4).ok_or(Error::OutOfBounds)?;
        let lens = caller.read(ptr_arg(args, 5), lens_size)?;
        let mut total: u32 = 0;
        for chunk in lens.chunks_exact(4) {
            let len = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let len = u32::try_from(len).map_err(|_| Error::OutOfBounds)?;
            total = total.checked_add(len).ok_or(Error::OutOfBounds)?;
        }
        caller.read(ptr_arg(args, 6), total)?;

        let module = match Module::load(code, &env.config) {
            Ok(module) => module,
            Err(err) => {
                debug!(%err, "child contract rejected");
                return Ok(Some(WasmValue::from_i32(CREATE_FAILED)));
            }
        };
        let owner = env.context.borrow().address;
        let nonce = env.context.borrow_mut().next_nonce();
        let address = ContractAddress::derive(&owner, nonce);
        caller.write(ptr_arg(args, 3), address.as_bytes())?;
        env.context.borrow_mut().stage_deployment(StagedDeployment { address, owner, module });
        debug!(%address, %owner, "child contract staged");
        Ok(Some(WasmValue::from_i32(CREATE_OK)))
    });

    register(&mut map, env, "asyncCall", |env, caller, args| {
        let destination = ContractAddress(read_word(caller, ptr_arg(args, 0))?);
        let value: Value = read_word(caller, ptr_arg(args, 1))?;
        let payload = caller.read(ptr_arg(args, 2), length_arg(args, 3)?)?;
        caller.charge(env.config.schedule.async_call)?;
        let mut ctx = env.context.borrow_mut();
        let sender = ctx.address;
        trace!(%destination, len = payload.len(), "async call queued");
        ctx.enqueue_async(AsyncCallRequest { sender, destination, value, payload });
        Ok(None)
    });

    register(&mut map, env, "finish", |env, caller, args| {
        let data = caller.read(ptr_arg(args, 0), length_arg(args, 1)?)?;
        env.context.borrow_mut().finish(&data)?;
        Ok(None)
    });

    register(&mut map, env, "int64finish", |env, _, args| {
        let v = args.first().map_or(0, |v| v.as_i64());
        env.context.borrow_mut().finish(&v.to_be_bytes())?;
        Ok(None)
    });

    register(&mut map, env, "signalError", |_, caller, args| {
        let msg = caller.read(ptr_arg(args, 0), length_arg(args, 1)?)?;
        Err(Error::SignaledError(String::from_utf8_lossy(&msg).into_owned()))
    });

    register(&mut map, env, "getCaller", |env, caller, args| {
        let address = env.context.borrow().caller;
        caller.write(ptr_arg(args, 0), address.as_bytes())?;
        Ok(None)
    });

    register(&mut map, env, "getSCAddress", |env, caller, args| {
        let address = env.context.borrow().address;
        caller.write(ptr_arg(args, 0), address.as_bytes())?;
        Ok(None)
    });

    register(&mut map, env, "getCallValue", |env, caller, args| {
        let value: Value = env.context.borrow().value;
        caller.write(ptr_arg(args, 0), &value)?;
        Ok(None)
    });

    map
}
