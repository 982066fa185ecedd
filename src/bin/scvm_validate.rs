use clap::Parser;
use std::path::{Path, PathBuf};
use scvm::{EngineConfig, Module};

mod utils;
use utils::{init_tracing, load_module_bytes};

#[derive(Parser, Debug)]
#[command(name = "scvm-validate")]
#[command(about = "Validate contract modules without executing them")]
#[command(long_about = "
SCVM Validate - contract module validator

Runs the full loader on each module: structural decoding, type checking of
every function body, host import resolution and entry point signatures.

Examples:
  # Validate a single module
  scvm-validate contract.wasm

  # Validate multiple modules
  scvm-validate parent.wasm child.wat

  # Quiet mode (only show errors)
  scvm-validate contract.wasm --quiet
")]
struct Args {
    /// Path(s) to contract module file(s)
    wasm_files: Vec<PathBuf>,

    /// Engine configuration as JSON, for the memory limit
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show verbose validation details
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode - only show errors
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn validate_file(path: &Path, config: &EngineConfig, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = load_module_bytes(path)?;
    if verbose {
        println!("  Size: {} bytes", bytes.len());
    }
    let module = Module::load(bytes, config)?;
    if verbose {
        println!("  Functions: {}", module.functions.len());
        println!("  Imports: {}", module.imports.len());
        println!("  Entry points: {}", module.entry_points().join(", "));
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => match EngineConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => EngineConfig::default(),
    };

    if args.wasm_files.is_empty() {
        eprintln!("Error: No module files specified");
        eprintln!("Usage: scvm-validate <WASM_FILES>...");
        std::process::exit(1);
    }

    let mut errors = Vec::new();
    for path in &args.wasm_files {
        if args.verbose {
            println!("Validating: {}", path.display());
        }
        match validate_file(path, &config, args.verbose) {
            Ok(()) => {
                if !args.quiet {
                    println!("VALID: {}", path.display());
                }
            }
            Err(e) => errors.push(format!("INVALID: {} - {}", path.display(), e)),
        }
    }

    if !errors.is_empty() {
        eprintln!("\nValidation errors:");
        for error in &errors {
            eprintln!("{}", error);
        }
    }

    if args.wasm_files.len() > 1 && !args.quiet {
        println!("\nSummary:");
        println!("  Valid: {}/{}", args.wasm_files.len() - errors.len(), args.wasm_files.len());
        if !errors.is_empty() {
            println!("  Invalid: {}/{}", errors.len(), args.wasm_files.len());
        }
    }

    if !errors.is_empty() {
        std::process::exit(1);
    }
}
