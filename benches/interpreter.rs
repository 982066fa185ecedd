use std::hint::black_box;
use std::rc::Rc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use scvm::instance::{HostFunctions, Instance, WasmValue};
use scvm::{CallInput, ContractAddress, Engine, EngineConfig, GasMeter, Module};

const LOOP_ITERATIONS: i32 = 100_000;

fn setup_loop_instance() -> (Instance, usize) {
    let bytes = wat::parse_str(r#"(module
      (func (export "mix") (param $n i32) (result i64) (local $acc i64)
        (block $done
          (loop $next
            (br_if $done (i32.eqz (local.get $n)))
            (local.set $acc
              (i64.xor
                (i64.rotl (local.get $acc) (i64.const 5))
                (i64.extend_i32_u (i32.mul (local.get $n) (i32.const -1640531535)))))
            (local.set $n (i32.sub (local.get $n) (i32.const 1)))
            (br $next)))
        (local.get $acc)))"#).expect("compile mix");
    let module = Rc::new(Module::compile(bytes).expect("validate mix"));
    let mut meter = GasMeter::new(u64::MAX);
    let instance = Instance::instantiate(module, &HostFunctions::new(), &EngineConfig::default(), &mut meter)
        .expect("instantiate mix");
    let idx = instance.module().exports["mix"].idx as usize;
    (instance, idx)
}

fn bench_interpreter_loop(c: &mut Criterion) {
    let (instance, idx) = setup_loop_instance();

    let mut group = c.benchmark_group("interpreter");
    group.throughput(Throughput::Elements(LOOP_ITERATIONS as u64));
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));
    group.bench_function("mix_loop", |b| {
        b.iter(|| {
            let mut meter = GasMeter::new(u64::MAX);
            let out = instance.call(idx, &[WasmValue::from_i32(black_box(LOOP_ITERATIONS))], &mut meter)
                .expect("run mix");
            black_box(out)
        })
    });
    group.finish();
}

fn bench_contract_call(c: &mut Criterion) {
    let code = wat::parse_str(r#"(module
      (import "env" "storageStore" (func $storageStore (param i32 i32 i32) (result i32)))
      (import "env" "int64finish" (func $int64finish (param i64)))
      (memory 1)
      (data (i32.const 0) "answer00000000000000000000000000")
      (data (i32.const 32) "\2d")
      (func (export "getUltimateAnswer")
        (drop (call $storageStore (i32.const 0) (i32.const 32) (i32.const 1)))
        (call $int64finish (i64.const 45))))"#).expect("compile answer");

    let engine = Engine::default();
    let harness = ContractAddress([0xaa; 32]);
    let address = engine.deploy(harness, code, Vec::new(), Vec::new()).expect("deploy answer");

    let mut group = c.benchmark_group("engine");
    group.bench_function("get_ultimate_answer", |b| {
        b.iter(|| {
            let outcome = engine.execute(CallInput::new(harness, address, "getUltimateAnswer"));
            assert!(outcome.is_finished());
            black_box(outcome)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_interpreter_loop, bench_contract_call);
criterion_main!(benches);
