use clap::Parser;
use std::path::PathBuf;
use scvm::{CallInput, ContractAddress, Engine, EngineConfig, ExecutionOutcome, InvocationStatus};

mod utils;
use utils::{init_tracing, load_module_bytes};

/// Account that deploys and calls the module.
const HARNESS_ACCOUNT: [u8; 32] = *b"scvm-run.harness.account........";

#[derive(Parser, Debug)]
#[command(name = "scvm-run")]
#[command(about = "Deploy a contract module and invoke one of its entry points")]
#[command(long_about = "
SCVM Run - smart contract module runner

Deploys a module (binary .wasm or text .wat) from a fixed harness account,
then invokes one exported entry point and prints the outcome.

Examples:
  # Invoke an entry point
  scvm-run answer.wat --invoke getUltimateAnswer

  # Pass call arguments as hex
  scvm-run parent.wasm --invoke createChild --arg 0061736d01000000

  # Limit gas and print the outcome as JSON
  scvm-run parent.wasm --invoke upgradeChild --gas 50000 --json

  # Enable lifecycle and host call logging
  scvm-run answer.wat --invoke getUltimateAnswer --debug
")]
struct Args {
    /// Path to the contract module
    wasm_file: PathBuf,

    /// Entry point to invoke after deployment
    #[arg(short, long)]
    invoke: Option<String>,

    /// Call argument as hex, repeatable
    #[arg(short, long = "arg", value_name = "HEX")]
    args: Vec<String>,

    /// Argument for the `init` export, repeatable
    #[arg(long = "init-arg", value_name = "HEX")]
    init_args: Vec<String>,

    /// Gas limit of the invocation
    #[arg(short, long)]
    gas: Option<u64>,

    /// Engine configuration as JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// List entry points instead of running
    #[arg(short, long)]
    list_exports: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn decode_args(raw: &[String]) -> Result<Vec<Vec<u8>>, String> {
    raw.iter()
        .map(|a| hex::decode(a.trim_start_matches("0x")).map_err(|e| format!("Invalid hex argument '{}': {}", a, e)))
        .collect()
}

fn print_outcome(outcome: &ExecutionOutcome, indent: usize) {
    let pad = " ".repeat(indent);
    match &outcome.status {
        InvocationStatus::Finished => println!("{}status: finished", pad),
        InvocationStatus::Faulted(failure) => println!("{}status: faulted ({:?}: {})", pad, failure.kind, failure.message),
    }
    println!("{}gas used: {}", pad, outcome.gas_used);
    if !outcome.result.is_empty() {
        println!("{}result: {}", pad, hex::encode(&outcome.result));
    }
    for (i, child) in outcome.async_outcomes.iter().enumerate() {
        println!("{}async call [{}]:", pad, i);
        print_outcome(child, indent + 2);
        if let Some(callback) = &child.callback {
            println!("{}  callback (code {}):", pad, child.return_code());
            print_outcome(callback, indent + 4);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let bytes = load_module_bytes(&args.wasm_file)?;
    tracing::debug!(size = bytes.len(), "module loaded");

    if args.list_exports {
        let module = scvm::Module::load(bytes, &config)
            .map_err(|e| format!("Failed to load module: {}", e))?;
        println!("Entry points:");
        for name in module.entry_points() {
            println!("  {}", name);
        }
        return Ok(());
    }

    let engine = Engine::new(config);
    let harness = ContractAddress(HARNESS_ACCOUNT);
    let address = engine.deploy(harness, bytes, Vec::new(), decode_args(&args.init_args)?)
        .map_err(|e| format!("Deployment failed: {}", e))?;
    if args.debug {
        eprintln!("Deployed at {}", address);
    }

    let Some(function) = args.invoke else {
        println!("Deployed at {}", address);
        return Ok(());
    };
    let mut input = CallInput::new(harness, address, function).with_arguments(decode_args(&args.args)?);
    if let Some(gas) = args.gas {
        input = input.with_gas_limit(gas);
    }

    let outcome = engine.execute(input);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome, 0);
    }

    if !outcome.is_finished() {
        std::process::exit(1);
    }
    Ok(())
}
