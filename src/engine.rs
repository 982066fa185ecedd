use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::address::ContractAddress;
use crate::call_data::CallData;
use crate::config::EngineConfig;
use crate::context::{AsyncCallRequest, CallContext, Effects, Value};
use crate::error::{Error, ErrorKind};
use crate::gas::GasMeter;
use crate::host::{self, HostEnv};
use crate::instance::Instance;
use crate::module::{Module, ModuleHandle};
use crate::registry::ContractRegistry;

/// Built-in async call that replaces a contract's code.
pub const UPGRADE_FUNCTION: &str = "upgradeContract";
/// Optional entry point run when the harness deploys a contract.
pub const INIT_FUNCTION: &str = "init";
/// Optional entry point that receives the outcome of each async call a
/// contract queued.
pub const CALLBACK_FUNCTION: &str = "callBack";

/// One call of an entry point, as submitted by the harness.
#[derive(Debug, Clone)]
pub struct CallInput {
    pub caller: ContractAddress,
    pub recipient: ContractAddress,
    pub function: String,
    pub arguments: Vec<Vec<u8>>,
    pub value: Value,
    /// Falls back to [`EngineConfig::gas_limit`].
    pub gas_limit: Option<u64>,
}

impl CallInput {
    pub fn new(caller: ContractAddress, recipient: ContractAddress, function: impl Into<String>) -> Self {
        Self {
            caller,
            recipient,
            function: function.into(),
            arguments: Vec::new(),
            value: [0; 32],
            gas_limit: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Vec<u8>>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(err: &Error) -> Self {
        Self { kind: err.kind(), message: err.message() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvocationStatus {
    Finished,
    Faulted(Failure),
}

/// Result of one invocation, including the outcomes of the async calls
/// it queued, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub status: InvocationStatus,
    pub result: Vec<u8>,
    pub gas_used: u64,
    pub async_outcomes: Vec<ExecutionOutcome>,
    /// The sender's `callBack` run after this async call, if it has one.
    pub callback: Option<Box<ExecutionOutcome>>,
}

impl ExecutionOutcome {
    fn faulted(err: &Error, gas_used: u64) -> Self {
        Self {
            status: InvocationStatus::Faulted(err.into()),
            result: Vec::new(),
            gas_used,
            async_outcomes: Vec::new(),
            callback: None,
        }
    }

    fn finished() -> Self {
        Self { status: InvocationStatus::Finished, result: Vec::new(), gas_used: 0, async_outcomes: Vec::new(), callback: None }
    }

    /// Return code handed to a `callBack`: 0 when finished.
    pub fn return_code(&self) -> u8 {
        self.failure().map_or(0, |failure| failure.kind.return_code())
    }

    pub fn is_finished(&self) -> bool {
        self.status == InvocationStatus::Finished
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            InvocationStatus::Faulted(failure) => Some(failure),
            InvocationStatus::Finished => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationState {
    Ready,
    Running,
    Finished,
    Faulted,
}

impl Display for InvocationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InvocationState::Ready => "ready",
            InvocationState::Running => "running",
            InvocationState::Finished => "finished",
            InvocationState::Faulted => "faulted",
        })
    }
}

/// Runs contracts against a registry it owns. Execution is serialized:
/// one invocation at a time, async calls after their parent.
pub struct Engine {
    registry: Rc<RefCell<ContractRegistry>>,
    config: Rc<EngineConfig>,
}

impl Default for Engine {
    fn default() -> Self { Self::new(EngineConfig::default()) }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { registry: Rc::new(RefCell::new(ContractRegistry::new())), config: Rc::new(config) }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// A copy of the registry as currently committed.
    pub fn registry(&self) -> ContractRegistry { self.registry.borrow().clone() }

    /// Deploys `code` on behalf of `creator`, running its `init` export with
    /// `arguments` if there is one. Nothing is registered if loading or
    /// `init` fails.
    pub fn deploy(&self, creator: ContractAddress, code: Vec<u8>, metadata: Vec<u8>, arguments: Vec<Vec<u8>>) -> Result<ContractAddress, Error> {
        let module = Module::load(code, &self.config)?;
        let nonce = self.registry.borrow().nonce(&creator);
        let address = ContractAddress::derive(&creator, nonce);

        let mut effects = Effects::default();
        if module.has_entry_point(INIT_FUNCTION) {
            let context = CallContext::new(address, creator, [0; 32], arguments, 0);
            let (result, _) = self.run(module.clone(), context, INIT_FUNCTION, self.config.gas_limit);
            effects = result?;
        }

        {
            let mut registry = self.registry.borrow_mut();
            registry.set_nonce(creator, nonce + 1);
            registry.deploy(address, module);
            let account = registry.account_mut(address);
            account.owner = Some(creator);
            account.code_metadata = metadata;
        }
        let async_calls = self.commit(address, &mut effects);
        for outcome in self.dispatch_all(async_calls, 1) {
            debug!(%address, finished = outcome.is_finished(), "init async call dispatched");
        }
        Ok(address)
    }

    /// Runs one entry point as a root invocation.
    pub fn execute(&self, input: CallInput) -> ExecutionOutcome {
        self.execute_at_depth(input, 0)
    }

    /// Replaces the code of `address`; only its owner may do so. Storage
    /// is untouched.
    pub fn upgrade(&self, sender: ContractAddress, address: ContractAddress, code: Vec<u8>, metadata: Vec<u8>) -> Result<(), Error> {
        {
            let registry = self.registry.borrow();
            registry.get(&address)?;
            if registry.owner(&address) != Some(sender) {
                return Err(Error::NotOwner);
            }
        }
        let module = Module::load(code, &self.config)?;
        let mut registry = self.registry.borrow_mut();
        registry.upgrade(&address, module)?;
        registry.account_mut(address).code_metadata = metadata;
        Ok(())
    }

    /// Committed storage of `address` under `key`, zero-filled to `len`.
    pub fn storage_load(&self, address: &ContractAddress, key: &[u8], len: usize) -> Vec<u8> {
        self.registry.borrow().storage_scope(address).load(key, len)
    }

    fn execute_at_depth(&self, input: CallInput, depth: u32) -> ExecutionOutcome {
        if depth > self.config.max_call_depth {
            warn!(recipient = %input.recipient, depth, "call depth exceeded");
            return ExecutionOutcome::faulted(&Error::CallDepthExceeded, 0);
        }
        let (module, nonce) = {
            let registry = self.registry.borrow();
            match registry.get(&input.recipient) {
                Ok(module) => (module, registry.nonce(&input.recipient)),
                Err(err) => return ExecutionOutcome::faulted(&err, 0),
            }
        };

        let gas_limit = input.gas_limit.unwrap_or(self.config.gas_limit);
        let context = CallContext::new(input.recipient, input.caller, input.value, input.arguments, nonce);
        let (result, gas_used) = self.run(module, context, &input.function, gas_limit);
        let mut effects = match result {
            Ok(effects) => effects,
            Err(err) => return ExecutionOutcome::faulted(&err, gas_used),
        };

        let async_calls = self.commit(input.recipient, &mut effects);
        ExecutionOutcome {
            status: InvocationStatus::Finished,
            result: std::mem::take(&mut effects.result),
            gas_used,
            async_outcomes: self.dispatch_all(async_calls, depth + 1),
            callback: None,
        }
    }

    /// Drives one invocation through its states. On success the staged
    /// effects are returned uncommitted.
    fn run(&self, module: ModuleHandle, context: CallContext, function: &str, gas_limit: u64) -> (Result<Effects, Error>, u64) {
        let address = context.address;
        let mut meter = GasMeter::new(gas_limit);
        let context = Rc::new(RefCell::new(context));
        debug!(%address, function, state = %InvocationState::Ready, gas_limit);

        let outcome = {
            let env = HostEnv { context: context.clone(), registry: self.registry.clone(), config: self.config.clone() };
            let imports = host::imports(&env);
            debug!(%address, function, state = %InvocationState::Running);
            Instance::instantiate(module, &imports, &self.config, &mut meter)
                .and_then(|instance| instance.invoke_export(function, &mut meter))
        };

        let gas_used = meter.used();
        match outcome {
            Ok(()) => {
                debug!(%address, function, state = %InvocationState::Finished, gas_used);
                (Ok(context.borrow_mut().seal()), gas_used)
            }
            Err(err) => {
                debug!(%address, function, state = %InvocationState::Faulted, gas_used, %err);
                (Err(err), gas_used)
            }
        }
    }

    /// Applies a finished invocation's staged writes, nonce and deployments,
    /// handing back its async queue.
    fn commit(&self, address: ContractAddress, effects: &mut Effects) -> Vec<AsyncCallRequest> {
        let mut registry = self.registry.borrow_mut();
        let scope = registry.storage_scope_mut(address);
        for (key, value) in std::mem::take(&mut effects.write_set) {
            scope.set(key, value);
        }
        if effects.nonce > registry.nonce(&address) {
            registry.set_nonce(address, effects.nonce);
        }
        for deployment in effects.deployments.drain(..) {
            registry.deploy(deployment.address, deployment.module);
            registry.account_mut(deployment.address).owner = Some(deployment.owner);
        }
        effects.async_calls.drain(..).collect()
    }

    /// Dispatches queued calls one at a time; each call's own queue and
    /// the sender's callback finish before its next sibling starts.
    fn dispatch_all(&self, requests: Vec<AsyncCallRequest>, depth: u32) -> Vec<ExecutionOutcome> {
        requests.into_iter().map(|request| {
            let (sender, destination) = (request.sender, request.destination);
            let mut outcome = self.dispatch(request, depth);
            if let Some(failure) = outcome.failure() {
                warn!(%destination, kind = ?failure.kind, message = %failure.message, "async call faulted");
            }
            outcome.callback = self.call_back(sender, destination, &outcome, depth + 1);
            outcome
        }).collect()
    }

    /// Reports `outcome` to the sender's `callBack` export with the
    /// arguments `[return code, result or failure message]`.
    fn call_back(&self, sender: ContractAddress, destination: ContractAddress, outcome: &ExecutionOutcome, depth: u32) -> Option<Box<ExecutionOutcome>> {
        let has_callback = self.registry.borrow().get(&sender)
            .map_or(false, |module| module.has_entry_point(CALLBACK_FUNCTION));
        if !has_callback {
            return None;
        }
        let data = match &outcome.status {
            InvocationStatus::Finished => outcome.result.clone(),
            InvocationStatus::Faulted(failure) => failure.message.clone().into_bytes(),
        };
        debug!(%sender, %destination, code = outcome.return_code(), "async callback");
        let input = CallInput::new(destination, sender, CALLBACK_FUNCTION)
            .with_arguments(vec![vec![outcome.return_code()], data]);
        Some(Box::new(self.execute_at_depth(input, depth)))
    }

    fn dispatch(&self, request: AsyncCallRequest, depth: u32) -> ExecutionOutcome {
        if depth > self.config.max_call_depth {
            return ExecutionOutcome::faulted(&Error::CallDepthExceeded, 0);
        }
        let call = match CallData::parse(&request.payload) {
            Ok(call) => call,
            Err(err) => return ExecutionOutcome::faulted(&err, 0),
        };

        if call.function == UPGRADE_FUNCTION {
            let mut arguments = call.arguments.into_iter();
            let Some(code) = arguments.next() else {
                return ExecutionOutcome::faulted(&Error::InvalidCallData("upgrade requires code"), 0);
            };
            let metadata = arguments.next().unwrap_or_default();
            return match self.upgrade(request.sender, request.destination, code, metadata) {
                Ok(()) => ExecutionOutcome::finished(),
                Err(err) => ExecutionOutcome::faulted(&err, 0),
            };
        }

        let input = CallInput {
            caller: request.sender,
            recipient: request.destination,
            function: call.function,
            arguments: call.arguments,
            value: request.value,
            gas_limit: None,
        };
        self.execute_at_depth(input, depth)
    }
}
