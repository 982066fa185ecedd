use scvm::{CallInput, ContractAddress, Engine, EngineConfig, Error, ErrorKind, ExecutionOutcome};

const HOST_IMPORTS: &str = r#"
  (import "env" "getNumArguments" (func $getNumArguments (result i32)))
  (import "env" "getArgumentLength" (func $getArgumentLength (param i32) (result i32)))
  (import "env" "getArgument" (func $getArgument (param i32 i32) (result i32)))
  (import "env" "storageStore" (func $storageStore (param i32 i32 i32) (result i32)))
  (import "env" "storageLoad" (func $storageLoad (param i32 i32) (result i32)))
  (import "env" "storageLoadLength" (func $storageLoadLength (param i32) (result i32)))
  (import "env" "createContract" (func $createContract (param i32 i32 i32 i32 i32 i32 i32) (result i32)))
  (import "env" "asyncCall" (func $asyncCall (param i32 i32 i32 i32)))
  (import "env" "finish" (func $finish (param i32 i32)))
  (import "env" "int64finish" (func $int64finish (param i64)))
  (import "env" "signalError" (func $signalError (param i32 i32)))
  (import "env" "getCaller" (func $getCaller (param i32)))
  (import "env" "getSCAddress" (func $getSCAddress (param i32)))
  (import "env" "getCallValue" (func $getCallValue (param i32)))
"#;

fn compile(body: &str) -> Vec<u8> {
    let text = format!("(module {}\n{})", HOST_IMPORTS, body);
    wat::parse_str(&text).unwrap_or_else(|e| panic!("invalid test contract: {}", e))
}

/// A 32-byte storage key: `prefix` padded with ASCII zeros.
fn key(prefix: &str) -> String {
    format!("{:0<32}", prefix)
}

fn be(v: i64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn harness() -> ContractAddress {
    ContractAddress([0xaa; 32])
}

fn deploy(engine: &Engine, code: Vec<u8>) -> ContractAddress {
    engine.deploy(harness(), code, Vec::new(), Vec::new()).unwrap()
}

fn call(engine: &Engine, address: ContractAddress, function: &str, args: Vec<Vec<u8>>) -> ExecutionOutcome {
    engine.execute(CallInput::new(harness(), address, function).with_arguments(args))
}

fn assert_faulted(outcome: &ExecutionOutcome, kind: ErrorKind) {
    let failure = outcome.failure().unwrap_or_else(|| panic!("expected {:?}, invocation finished", kind));
    assert_eq!(failure.kind, kind, "unexpected failure: {}", failure.message);
}

fn parent_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 128) "{child_key}")
  (data (i32.const 160) "missing child code")
  (data (i32.const 200) "@0100")
  (data (i32.const 256) "upgradeContract@")

  (func $memcpy (param $dst i32) (param $src i32) (param $len i32)
    (block $done
      (loop $copy
        (br_if $done (i32.eqz (local.get $len)))
        (i32.store8 (local.get $dst) (i32.load8_u (local.get $src)))
        (local.set $dst (i32.add (local.get $dst) (i32.const 1)))
        (local.set $src (i32.add (local.get $src) (i32.const 1)))
        (local.set $len (i32.sub (local.get $len) (i32.const 1)))
        (br $copy))))

  (func (export "getUltimateAnswer")
    (call $int64finish (i64.const 45)))

  (func (export "getChildAddress")
    (drop (call $storageLoad (i32.const 128) (i32.const 64)))
    (call $finish (i32.const 64) (i32.const 32)))

  (func (export "createChild") (local $len i32) (local $status i32)
    (if (i32.lt_s (call $getNumArguments) (i32.const 1))
      (then (call $signalError (i32.const 160) (i32.const 18))))
    (local.set $len (call $getArgument (i32.const 0) (i32.const 1024)))
    (local.set $status
      (call $createContract (i32.const 0) (i32.const 1024) (local.get $len) (i32.const 64)
        (i32.const 0) (i32.const 0) (i32.const 0)))
    (if (i32.eqz (local.get $status))
      (then (drop (call $storageStore (i32.const 128) (i32.const 64) (i32.const 32)))))
    (call $int64finish (i64.extend_i32_u (local.get $status))))

  (func (export "upgradeChild") (local $len i32)
    (local.set $len (call $getArgument (i32.const 0) (i32.const 272)))
    (call $memcpy (i32.add (i32.const 272) (local.get $len)) (i32.const 200) (i32.const 5))
    (drop (call $storageLoad (i32.const 128) (i32.const 64)))
    (call $asyncCall (i32.const 64) (i32.const 0) (i32.const 256) (i32.add (local.get $len) (i32.const 21))))
"#, child_key = key("child")))
}

fn child_code(version: i64) -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{value_key}")
  (func (export "version")
    (call $int64finish (i64.const {version})))
  (func (export "setValue") (local $len i32)
    (local.set $len (call $getArgument (i32.const 0) (i32.const 64)))
    (drop (call $storageStore (i32.const 0) (i32.const 64) (local.get $len))))
"#, value_key = key("value"), version = version))
}

#[test]
fn ultimate_answer_is_45() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    let outcome = call(&engine, parent, "getUltimateAnswer", vec![]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.result, be(45));
    assert!(outcome.async_outcomes.is_empty());
}

#[test]
fn create_child_stores_its_address() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    let outcome = call(&engine, parent, "createChild", vec![child_code(1)]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.result, be(0));

    let stored = engine.storage_load(&parent, key("child").as_bytes(), 32);
    let child = ContractAddress::from_slice(&stored).unwrap();
    assert_eq!(child, ContractAddress::derive(&parent, 0));
    assert!(child.is_contract());

    let registry = engine.registry();
    assert!(registry.contains(&child));
    assert_eq!(registry.owner(&child), Some(parent));
    assert_eq!(registry.nonce(&parent), 1);
    drop(registry);

    let outcome = call(&engine, parent, "getChildAddress", vec![]);
    assert_eq!(outcome.result, stored);

    let outcome = call(&engine, child, "version", vec![]);
    assert_eq!(outcome.result, be(1));
}

#[test]
fn second_child_gets_a_fresh_address() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    call(&engine, parent, "createChild", vec![child_code(1)]);
    let first = engine.storage_load(&parent, key("child").as_bytes(), 32);
    call(&engine, parent, "createChild", vec![child_code(1)]);
    let second = engine.storage_load(&parent, key("child").as_bytes(), 32);

    assert_ne!(first, second);
    assert_eq!(second, ContractAddress::derive(&parent, 1).as_bytes().to_vec());
}

#[test]
fn malformed_child_code_returns_status() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    let outcome = call(&engine, parent, "createChild", vec![b"not a module".to_vec()]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.result, be(1));
    assert!(!engine.registry().contains(&ContractAddress::derive(&parent, 0)));
    assert_eq!(engine.storage_load(&parent, key("child").as_bytes(), 32), vec![0; 32]);
}

#[test]
fn create_child_without_code_signals_error() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    let outcome = call(&engine, parent, "createChild", vec![]);
    assert_faulted(&outcome, ErrorKind::SignaledError);
    assert_eq!(outcome.failure().unwrap().message, "missing child code");
}

#[test]
fn upgrade_child_replaces_code_and_keeps_storage() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());
    call(&engine, parent, "createChild", vec![child_code(1)]);
    let child = ContractAddress::derive(&parent, 0);

    let outcome = call(&engine, child, "setValue", vec![b"persisted".to_vec()]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    let before = engine.registry().storage_scope(&child).clone();

    let new_code = hex::encode(child_code(2)).into_bytes();
    let outcome = call(&engine, parent, "upgradeChild", vec![new_code]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.async_outcomes.len(), 1);
    assert!(outcome.async_outcomes[0].is_finished(), "{:?}", outcome.async_outcomes[0].failure());

    assert_eq!(call(&engine, child, "version", vec![]).result, be(2));
    assert_eq!(engine.registry().storage_scope(&child), &before);
    assert_eq!(engine.storage_load(&child, key("value").as_bytes(), 9), b"persisted".to_vec());
    assert_eq!(engine.registry().code_metadata(&child), Some(&[0x01, 0x00][..]));
}

#[test]
fn upgrade_with_malformed_code_faults_only_the_async_call() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());
    call(&engine, parent, "createChild", vec![child_code(1)]);
    let child = ContractAddress::derive(&parent, 0);

    let outcome = call(&engine, parent, "upgradeChild", vec![b"00ff00ff".to_vec()]);
    assert!(outcome.is_finished());
    assert_faulted(&outcome.async_outcomes[0], ErrorKind::MalformedModule);
    assert_eq!(call(&engine, child, "version", vec![]).result, be(1));
}

#[test]
fn only_the_owner_may_upgrade() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());
    call(&engine, parent, "createChild", vec![child_code(1)]);
    let child = ContractAddress::derive(&parent, 0);

    assert_eq!(engine.upgrade(harness(), child, child_code(2), vec![]), Err(Error::NotOwner));
    assert_eq!(engine.upgrade(parent, child, child_code(2), vec![]), Ok(()));
    assert_eq!(call(&engine, child, "version", vec![]).result, be(2));

    let nowhere = ContractAddress([0x11; 32]);
    assert_eq!(engine.upgrade(harness(), nowhere, child_code(2), vec![]), Err(Error::NotFound(nowhere)));
}

fn storage_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{key_a}")
  (data (i32.const 32) "{key_b}")
  (data (i32.const 64) "hello")
  (data (i32.const 80) "rollback")

  (func (export "store")
    (drop (call $storageStore (i32.const 0) (i32.const 64) (i32.const 5))))

  (func (export "storeThenFail")
    (drop (call $storageStore (i32.const 0) (i32.const 80) (i32.const 8)))
    (drop (call $storageStore (i32.const 32) (i32.const 64) (i32.const 5)))
    (call $signalError (i32.const 80) (i32.const 8)))

  (func (export "statuses")
    (call $int64finish (i64.extend_i32_u (call $storageStore (i32.const 32) (i32.const 64) (i32.const 5))))
    (call $int64finish (i64.extend_i32_u (call $storageStore (i32.const 32) (i32.const 64) (i32.const 5))))
    (call $int64finish (i64.extend_i32_u (call $storageStore (i32.const 32) (i32.const 80) (i32.const 8))))
    (call $int64finish (i64.extend_i32_u (call $storageStore (i32.const 32) (i32.const 64) (i32.const 0)))))

  (func (export "loadMissing")
    (call $int64finish (i64.extend_i32_u (call $storageLoadLength (i32.const 32)))))

  (func (export "readBack")
    (call $finish (i32.const 200) (call $storageLoad (i32.const 0) (i32.const 200))))

  (func (export "twoParts")
    (call $finish (i32.const 64) (i32.const 2))
    (call $finish (i32.const 80) (i32.const 4)))

  (func (export "identity")
    (call $getCaller (i32.const 300))
    (call $getSCAddress (i32.const 332))
    (call $finish (i32.const 300) (i32.const 64)))
"#, key_a = key("a"), key_b = key("b")))
}

#[test]
fn storage_writes_commit_on_finish() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    assert!(call(&engine, contract, "store", vec![]).is_finished());
    assert_eq!(engine.storage_load(&contract, key("a").as_bytes(), 5), b"hello".to_vec());
    assert_eq!(call(&engine, contract, "readBack", vec![]).result, b"hello".to_vec());
}

#[test]
fn signal_error_discards_every_staged_write() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());
    call(&engine, contract, "store", vec![]);

    let outcome = call(&engine, contract, "storeThenFail", vec![]);
    assert_faulted(&outcome, ErrorKind::SignaledError);
    assert_eq!(outcome.failure().unwrap().message, "rollback");
    assert!(outcome.result.is_empty());

    assert_eq!(engine.storage_load(&contract, key("a").as_bytes(), 5), b"hello".to_vec());
    assert_eq!(engine.registry().storage_scope(&contract).get(key("b").as_bytes()), None);
}

#[test]
fn storage_store_reports_status_codes() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    let outcome = call(&engine, contract, "statuses", vec![]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    let expected: Vec<u8> = [1, 0, 2, 3].iter().flat_map(|s| be(*s)).collect();
    assert_eq!(outcome.result, expected);
    // Added then deleted within the same invocation leaves nothing behind.
    assert!(engine.registry().storage_scope(&contract).get(key("b").as_bytes()).is_none());
}

#[test]
fn absent_keys_load_as_zeros() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    assert_eq!(call(&engine, contract, "loadMissing", vec![]).result, be(0));
    assert_eq!(engine.storage_load(&contract, key("missing").as_bytes(), 32), vec![0; 32]);
    assert_eq!(engine.storage_load(&ContractAddress([3; 32]), b"anything", 4), vec![0; 4]);
}

#[test]
fn finish_appends_in_call_order() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    let outcome = call(&engine, contract, "twoParts", vec![]);
    assert_eq!(outcome.result, b"heroll".to_vec());
}

#[test]
fn caller_and_own_address_are_visible() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    let outcome = call(&engine, contract, "identity", vec![]);
    let mut expected = harness().as_bytes().to_vec();
    expected.extend_from_slice(contract.as_bytes());
    assert_eq!(outcome.result, expected);
}

fn host_abi_code() -> Vec<u8> {
    compile(r#"
  (memory 1)
  (func (export "argumentCount")
    (call $int64finish (i64.extend_i32_u (call $getNumArguments))))
  (func (export "missingArgument")
    (call $int64finish (i64.extend_i32_s (call $getArgumentLength (i32.const 5))))
    (call $int64finish (i64.extend_i32_s (call $getArgument (i32.const -1) (i32.const 0)))))
  (func (export "secondArgument") (local $len i32)
    (local.set $len (call $getArgument (i32.const 1) (i32.const 16)))
    (call $finish (i32.const 16) (local.get $len)))
  (func (export "readPastEnd")
    (call $finish (i32.const 65530) (i32.const 100)))
  (func (export "emptyReadPastEnd")
    (call $finish (i32.const 70000) (i32.const 0)))
  (func (export "negativeLength")
    (call $finish (i32.const 0) (i32.const -4)))
  (func (export "divideByZero")
    (drop (i32.div_s (i32.const 1) (i32.const 0))))
  (func (export "unreachable")
    unreachable)
  (func (export "spin")
    (loop $forever (br $forever)))
  (func (export "callValue")
    (call $getCallValue (i32.const 0))
    (call $finish (i32.const 0) (i32.const 32)))
"#)
}

#[test]
fn arguments_are_exposed_by_index() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());
    let args = vec![b"first".to_vec(), b"second".to_vec()];

    assert_eq!(call(&engine, contract, "argumentCount", args.clone()).result, be(2));
    assert_eq!(call(&engine, contract, "secondArgument", args).result, b"second".to_vec());
}

#[test]
fn call_value_is_visible() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());

    let mut input = CallInput::new(harness(), contract, "callValue");
    input.value = [7; 32];
    let outcome = engine.execute(input);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.result, vec![7; 32]);
    assert_eq!(call(&engine, contract, "callValue", vec![]).result, vec![0; 32]);
}

#[test]
fn bad_argument_index_is_a_status_not_a_fault() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());

    let outcome = call(&engine, contract, "missingArgument", vec![b"x".to_vec()]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.result, [be(-1), be(-1)].concat());
}

#[test]
fn out_of_bounds_access_faults_the_invocation() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());

    assert_faulted(&call(&engine, contract, "readPastEnd", vec![]), ErrorKind::OutOfBounds);
    assert_faulted(&call(&engine, contract, "negativeLength", vec![]), ErrorKind::OutOfBounds);

    let outcome = call(&engine, contract, "emptyReadPastEnd", vec![]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert!(outcome.result.is_empty());
}

#[test]
fn wasm_traps_fault_without_poisoning_the_engine() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());

    assert_faulted(&call(&engine, contract, "divideByZero", vec![]), ErrorKind::Trap);
    assert_faulted(&call(&engine, contract, "unreachable", vec![]), ErrorKind::Trap);
    assert_faulted(&call(&engine, contract, "noSuchFunction", vec![]), ErrorKind::EntryPointNotFound);
    assert_faulted(&call(&engine, ContractAddress([9; 32]), "spin", vec![]), ErrorKind::NotFound);

    assert!(call(&engine, contract, "argumentCount", vec![]).is_finished());
}

#[test]
fn gas_exhaustion_faults_and_drains_the_budget() {
    let engine = Engine::default();
    let contract = deploy(&engine, host_abi_code());

    let outcome = engine.execute(CallInput::new(harness(), contract, "spin").with_gas_limit(1_000));
    assert_faulted(&outcome, ErrorKind::OutOfResources);
    assert_eq!(outcome.gas_used, 1_000);
}

#[test]
fn gas_accounting_is_deterministic() {
    let engine = Engine::default();
    let parent = deploy(&engine, parent_code());

    let first = call(&engine, parent, "getUltimateAnswer", vec![]);
    let second = call(&engine, parent, "getUltimateAnswer", vec![]);
    assert!(first.gas_used > 0);
    assert!(first.gas_used < engine.config().gas_limit);
    assert_eq!(first.gas_used, second.gas_used);

    let starved = engine.execute(CallInput::new(harness(), parent, "getUltimateAnswer").with_gas_limit(first.gas_used - 1));
    assert_faulted(&starved, ErrorKind::OutOfResources);
    assert!(starved.result.is_empty());
}

#[test]
fn out_of_gas_before_a_store_commits_nothing() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    let outcome = engine.execute(CallInput::new(harness(), contract, "store").with_gas_limit(50));
    assert_faulted(&outcome, ErrorKind::OutOfResources);
    assert_eq!(engine.storage_load(&contract, key("a").as_bytes(), 5), vec![0; 5]);
}

fn recorder_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{last_key}")
  (data (i32.const 32) "boom")
  (func (export "record") (local $len i32)
    (local.set $len (call $getArgument (i32.const 0) (i32.const 64)))
    (drop (call $storageStore (i32.const 0) (i32.const 64) (local.get $len)))
    (call $finish (i32.const 64) (local.get $len)))
  (func (export "boom")
    (drop (call $storageStore (i32.const 0) (i32.const 32) (i32.const 4)))
    (call $signalError (i32.const 32) (i32.const 4)))
"#, last_key = key("last")))
}

fn fanout_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{flag_key}")
  (data (i32.const 200) "record@01")
  (data (i32.const 220) "boom")
  (data (i32.const 240) "record@02")
  (data (i32.const 260) "done")
  (func (export "fanout")
    (drop (call $getArgument (i32.const 0) (i32.const 64)))
    (drop (call $storageStore (i32.const 0) (i32.const 260) (i32.const 4)))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 200) (i32.const 9))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 220) (i32.const 4))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 240) (i32.const 9)))
  (func (export "fanoutThenFail")
    (drop (call $getArgument (i32.const 0) (i32.const 64)))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 200) (i32.const 9))
    unreachable)
"#, flag_key = key("flag")))
}

#[test]
fn async_calls_run_after_the_parent_in_fifo_order() {
    let engine = Engine::default();
    let recorder = deploy(&engine, recorder_code());
    let parent = deploy(&engine, fanout_code());

    let outcome = call(&engine, parent, "fanout", vec![recorder.as_bytes().to_vec()]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.async_outcomes.len(), 3);

    assert_eq!(outcome.async_outcomes[0].result, vec![1]);
    assert_faulted(&outcome.async_outcomes[1], ErrorKind::SignaledError);
    assert_eq!(outcome.async_outcomes[1].failure().unwrap().message, "boom");
    assert_eq!(outcome.async_outcomes[2].result, vec![2]);
    assert!(outcome.async_outcomes.iter().all(|child| child.callback.is_none()));

    // The failing sibling did not undo the parent or the first call.
    assert_eq!(engine.storage_load(&parent, key("flag").as_bytes(), 4), b"done".to_vec());
    assert_eq!(engine.storage_load(&recorder, key("last").as_bytes(), 1), vec![2]);
}

fn requester_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{reply_key}")
  (data (i32.const 200) "record@07")
  (data (i32.const 220) "boom")
  (func (export "request")
    (drop (call $getArgument (i32.const 0) (i32.const 64)))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 200) (i32.const 9))
    (call $asyncCall (i32.const 64) (i32.const 300) (i32.const 220) (i32.const 4)))
  (func (export "callBack") (local $len i32)
    (drop (call $getArgument (i32.const 0) (i32.const 96)))
    (local.set $len (call $getArgument (i32.const 1) (i32.const 128)))
    ;; One key per return code: the code replaces the key's last byte.
    (i32.store8 (i32.const 31) (i32.load8_u (i32.const 96)))
    (drop (call $storageStore (i32.const 0) (i32.const 128) (local.get $len)))
    (call $finish (i32.const 96) (i32.const 1)))
"#, reply_key = key("reply")))
}

fn reply_key(code: u8) -> Vec<u8> {
    let mut k = key("reply").into_bytes();
    k[31] = code;
    k
}

#[test]
fn senders_are_called_back_with_each_outcome() {
    let engine = Engine::default();
    let recorder = deploy(&engine, recorder_code());
    let requester = deploy(&engine, requester_code());

    let outcome = call(&engine, requester, "request", vec![recorder.as_bytes().to_vec()]);
    assert!(outcome.is_finished(), "{:?}", outcome.failure());
    assert_eq!(outcome.async_outcomes.len(), 2);

    let success = outcome.async_outcomes[0].callback.as_deref().expect("callback after success");
    assert!(success.is_finished(), "{:?}", success.failure());
    assert_eq!(success.result, vec![0]);

    assert_faulted(&outcome.async_outcomes[1], ErrorKind::SignaledError);
    assert_eq!(outcome.async_outcomes[1].return_code(), ErrorKind::SignaledError.return_code());
    let failure = outcome.async_outcomes[1].callback.as_deref().expect("callback after fault");
    assert!(failure.is_finished(), "{:?}", failure.failure());
    assert_eq!(failure.result, vec![ErrorKind::SignaledError.return_code()]);

    // The sender sees the child's result data, or its failure message.
    assert_eq!(engine.storage_load(&requester, &reply_key(0), 1), vec![7]);
    let code = ErrorKind::SignaledError.return_code();
    assert_eq!(engine.storage_load(&requester, &reply_key(code), 4), b"boom".to_vec());
}

#[test]
fn callbacks_count_against_the_depth_limit() {
    let config = EngineConfig { max_call_depth: 1, ..EngineConfig::default() };
    let engine = Engine::new(config);
    let recorder = deploy(&engine, recorder_code());
    let requester = deploy(&engine, requester_code());

    let outcome = call(&engine, requester, "request", vec![recorder.as_bytes().to_vec()]);
    let callback = outcome.async_outcomes[0].callback.as_deref().expect("callback reported");
    assert_faulted(callback, ErrorKind::CallDepthExceeded);
    assert_eq!(engine.storage_load(&requester, &reply_key(0), 1), vec![0]);
}

#[test]
fn registry_snapshots_survive_later_invocations() {
    let engine = Engine::default();
    let contract = deploy(&engine, storage_code());

    let before = engine.registry();
    assert!(call(&engine, contract, "store", vec![]).is_finished());
    assert_eq!(before.storage_scope(&contract).get(key("a").as_bytes()), None);
    assert_eq!(engine.registry().storage_scope(&contract).get(key("a").as_bytes()), Some(&b"hello"[..]));
}

#[test]
fn a_faulted_parent_dispatches_nothing() {
    let engine = Engine::default();
    let recorder = deploy(&engine, recorder_code());
    let parent = deploy(&engine, fanout_code());

    let outcome = call(&engine, parent, "fanoutThenFail", vec![recorder.as_bytes().to_vec()]);
    assert_faulted(&outcome, ErrorKind::Trap);
    assert!(outcome.async_outcomes.is_empty());
    assert_eq!(engine.storage_load(&recorder, key("last").as_bytes(), 1), vec![0]);
}

#[test]
fn async_call_to_unknown_address_reports_not_found() {
    let engine = Engine::default();
    let parent = deploy(&engine, fanout_code());

    let outcome = call(&engine, parent, "fanout", vec![vec![0x42; 32]]);
    assert!(outcome.is_finished());
    assert_eq!(outcome.async_outcomes.len(), 3);
    for child in &outcome.async_outcomes {
        assert_faulted(child, ErrorKind::NotFound);
    }
}

#[test]
fn async_recursion_stops_at_the_depth_limit() {
    let config = EngineConfig { max_call_depth: 3, ..EngineConfig::default() };
    let engine = Engine::new(config);
    let contract = deploy(&engine, compile(r#"
  (memory 1)
  (data (i32.const 100) "recurse")
  (func (export "recurse")
    (call $getSCAddress (i32.const 0))
    (call $asyncCall (i32.const 0) (i32.const 200) (i32.const 100) (i32.const 7)))
"#));

    let outcome = call(&engine, contract, "recurse", vec![]);
    let mut current = &outcome;
    for _ in 0..3 {
        assert!(current.is_finished(), "{:?}", current.failure());
        assert_eq!(current.async_outcomes.len(), 1);
        current = &current.async_outcomes[0];
    }
    assert!(current.is_finished());
    assert_faulted(&current.async_outcomes[0], ErrorKind::CallDepthExceeded);
    assert!(current.async_outcomes[0].async_outcomes.is_empty());
}

fn init_code() -> Vec<u8> {
    compile(&format!(r#"
  (memory 1)
  (data (i32.const 0) "{owner_key}")
  (func (export "init") (local $len i32)
    (if (i32.eqz (call $getNumArguments))
      (then (call $signalError (i32.const 0) (i32.const 5))))
    (local.set $len (call $getArgument (i32.const 0) (i32.const 64)))
    (drop (call $storageStore (i32.const 0) (i32.const 64) (local.get $len))))
"#, owner_key = key("owner")))
}

#[test]
fn deploy_runs_init_and_registers_on_success() {
    let engine = Engine::default();

    let err = engine.deploy(harness(), init_code(), b"meta".to_vec(), vec![]).unwrap_err();
    assert_eq!(err, Error::SignaledError("owner".to_string()));
    let expected = ContractAddress::derive(&harness(), 0);
    assert!(!engine.registry().contains(&expected));
    assert_eq!(engine.registry().nonce(&harness()), 0);

    let address = engine.deploy(harness(), init_code(), b"meta".to_vec(), vec![b"abc".to_vec()]).unwrap();
    assert_eq!(address, expected);
    assert_eq!(engine.storage_load(&address, key("owner").as_bytes(), 3), b"abc".to_vec());

    let registry = engine.registry();
    assert_eq!(registry.owner(&address), Some(harness()));
    assert_eq!(registry.code_metadata(&address), Some(&b"meta"[..]));
    assert_eq!(registry.nonce(&harness()), 1);
}

#[test]
fn deploy_rejects_what_the_loader_rejects() {
    let engine = Engine::default();

    let err = engine.deploy(harness(), b"\0asm\x02\0\0\0".to_vec(), vec![], vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModule);

    let unresolved = wat::parse_str(r#"(module (import "env" "selfDestruct" (func)))"#).unwrap();
    let err = engine.deploy(harness(), unresolved, vec![], vec![]).unwrap_err();
    assert_eq!(err, Error::UnresolvedImport { module: "env".into(), field: "selfDestruct".into() });

    assert_eq!(engine.registry().nonce(&harness()), 0);
}
