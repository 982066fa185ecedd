use scvm::error::*;
use scvm::leb128::{safe_read_leb128, safe_read_sleb128};
use scvm::context::CallContext;
use scvm::wasm_memory::WasmMemory;
use scvm::{CallData, ConfigError, ContractAddress, EngineConfig, GasMeter, StorageScope};

#[test]
fn leb128_unsigned() {
    let mut pc = 0;
    assert_eq!(safe_read_leb128::<u32>(&[0xe5, 0x8e, 0x26], &mut pc, 32), Ok(624_485));
    assert_eq!(pc, 3);

    let mut pc = 0;
    assert_eq!(safe_read_leb128::<u32>(&[0xff, 0xff, 0xff, 0xff, 0x0f], &mut pc, 32), Ok(u32::MAX));

    // Bits beyond the declared width.
    let mut pc = 0;
    assert_eq!(safe_read_leb128::<u32>(&[0xff, 0xff, 0xff, 0xff, 0x1f], &mut pc, 32), Err(Error::MalformedModule(INT_TOO_LARGE)));
    assert_eq!(pc, 0);

    let mut pc = 0;
    assert_eq!(safe_read_leb128::<u32>(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00], &mut pc, 32), Err(Error::MalformedModule(INT_TOO_LONG)));

    let mut pc = 0;
    assert_eq!(safe_read_leb128::<u32>(&[0x80, 0x80], &mut pc, 32), Err(Error::MalformedModule(UNEXPECTED_END)));
}

#[test]
fn leb128_signed() {
    let mut pc = 0;
    assert_eq!(safe_read_sleb128::<i32>(&[0x7f], &mut pc, 32), Ok(-1));

    let mut pc = 0;
    assert_eq!(safe_read_sleb128::<i32>(&[0xc0, 0xbb, 0x78], &mut pc, 32), Ok(-123_456));

    let mut pc = 0;
    assert_eq!(safe_read_sleb128::<i64>(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f], &mut pc, 64), Ok(i64::MIN));

    // The unused bits of the last byte must repeat the sign bit.
    let mut pc = 0;
    assert_eq!(safe_read_sleb128::<i32>(&[0xff, 0xff, 0xff, 0xff, 0x4f], &mut pc, 32), Err(Error::MalformedModule(INT_TOO_LARGE)));
}

#[test]
fn call_data_round_trip() {
    let call = CallData::new("upgradeContract", vec![vec![0x00, 0x61, 0x73, 0x6d], vec![0x01, 0x00]]);
    assert_eq!(call.to_string(), "upgradeContract@0061736d@0100");
    assert_eq!(CallData::parse(&call.encode()), Ok(call));

    let bare = CallData::parse(b"getUltimateAnswer").unwrap();
    assert_eq!(bare.function, "getUltimateAnswer");
    assert!(bare.arguments.is_empty());

    let empty_arg = CallData::parse(b"record@").unwrap();
    assert_eq!(empty_arg.arguments, vec![Vec::<u8>::new()]);
}

#[test]
fn call_data_rejects_malformed_payloads() {
    assert!(matches!(CallData::parse(b""), Err(Error::InvalidCallData(_))));
    assert!(matches!(CallData::parse(b"@00"), Err(Error::InvalidCallData(_))));
    assert!(matches!(CallData::parse(b"f@0g"), Err(Error::InvalidCallData(_))));
    assert!(matches!(CallData::parse(b"f@123"), Err(Error::InvalidCallData(_))));
    assert!(matches!(CallData::parse(&[0x66, 0xff]), Err(Error::InvalidCallData(_))));
}

#[test]
fn address_derivation_is_deterministic() {
    let creator = ContractAddress([0x5a; 32]);
    let a = ContractAddress::derive(&creator, 0);
    assert_eq!(a, ContractAddress::derive(&creator, 0));
    assert_ne!(a, ContractAddress::derive(&creator, 1));
    assert_ne!(a, ContractAddress::derive(&ContractAddress([0x5b; 32]), 0));

    assert!(a.is_contract());
    assert!(!creator.is_contract());
    assert_eq!(&a.as_bytes()[..8], &[0; 8]);
    assert_eq!(&a.as_bytes()[30..], &creator.as_bytes()[30..]);
}

#[test]
fn address_hex_forms() {
    let address = ContractAddress::derive(&ContractAddress::default(), 7);
    let text = address.to_string();
    assert_eq!(text.len(), 64);
    assert_eq!(text.parse::<ContractAddress>(), Ok(address));
    assert_eq!(format!("0x{}", text).parse::<ContractAddress>(), Ok(address));
    assert!("abcd".parse::<ContractAddress>().is_err());
    assert_eq!(ContractAddress::from_slice(&[1; 31]), None);
}

#[test]
fn storage_scope_load_pads_and_truncates() {
    let mut scope = StorageScope::new();
    scope.set(b"k".to_vec(), b"abc".to_vec());

    assert_eq!(scope.load(b"k", 5), b"abc\0\0".to_vec());
    assert_eq!(scope.load(b"k", 2), b"ab".to_vec());
    assert_eq!(scope.load(b"missing", 3), vec![0; 3]);

    scope.set(b"k".to_vec(), Vec::new());
    assert!(scope.is_empty());
}

#[test]
fn argument_lookup_reports_the_bad_index() {
    let context = CallContext::new(ContractAddress([1; 32]), ContractAddress([2; 32]), [0; 32], vec![b"only".to_vec()], 0);
    assert_eq!(context.argument(0), Ok(&b"only"[..]));
    assert_eq!(context.argument(1), Err(Error::IndexOutOfRange(1)));
    assert_eq!(context.argument(-1), Err(Error::IndexOutOfRange(u32::MAX)));
}

#[test]
fn return_codes_distinguish_failure_kinds() {
    assert_eq!(ErrorKind::EntryPointNotFound.return_code(), 1);
    assert_eq!(ErrorKind::NotFound.return_code(), 3);
    assert_eq!(ErrorKind::SignaledError.return_code(), 4);
    assert_eq!(ErrorKind::OutOfResources.return_code(), 5);
    assert_eq!(ErrorKind::CallDepthExceeded.return_code(), 8);
    assert_ne!(ErrorKind::Trap.return_code(), 0);
}

#[test]
fn linear_memory_bounds() {
    let mut memory = WasmMemory::new(1, 2);
    assert_eq!(memory.byte_len(), 65536);

    memory.write(65532, &[1, 2, 3, 4]).unwrap();
    assert_eq!(memory.read(65532, 4), Ok(vec![1, 2, 3, 4]));
    assert_eq!(memory.read(65533, 4), Err(Error::OutOfBounds));
    assert_eq!(memory.write(65535, &[0, 0]), Err(Error::OutOfBounds));
    assert_eq!(memory.read(u32::MAX, 2), Err(Error::OutOfBounds));

    // Zero-length accesses never fault.
    assert_eq!(memory.read(u32::MAX, 0), Ok(vec![]));
    assert_eq!(memory.write(u32::MAX, &[]), Ok(()));

    assert_eq!(memory.grow(1), Ok(1));
    assert_eq!(memory.grow(1), Err(Error::MemoryLimitExceeded));
    assert_eq!(memory.read(65533, 4), Ok(vec![2, 3, 4, 0]));
}

#[test]
fn gas_meter_drains_on_exhaustion() {
    let mut meter = GasMeter::new(100);
    meter.charge(40).unwrap();
    meter.charge_scaled(10, 5, 4).unwrap();
    assert_eq!(meter.remaining(), 30);
    assert_eq!(meter.charge(31), Err(Error::OutOfResources));
    assert_eq!(meter.remaining(), 0);
    assert_eq!(meter.used(), 100);
    assert!(meter.is_exhausted());
}

#[test]
fn config_defaults_fill_missing_fields() {
    let config = EngineConfig::from_json_str(r#"{ "gas_limit": 5000, "schedule": { "host_call": 3 } }"#).unwrap();
    assert_eq!(config.gas_limit, 5000);
    assert_eq!(config.max_call_depth, EngineConfig::default().max_call_depth);
    assert_eq!(config.schedule.host_call, 3);
    assert_eq!(config.schedule.storage_store, EngineConfig::default().schedule.storage_store);

    assert!(matches!(EngineConfig::from_json_str("{ gas_limit"), Err(ConfigError::Parse(_))));
    assert!(matches!(EngineConfig::from_json_file("/nonexistent/scvm.json"), Err(ConfigError::Io(_))));
}
