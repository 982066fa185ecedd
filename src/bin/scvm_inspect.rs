use clap::Parser;
use std::path::PathBuf;
use scvm::module::{ExternKind, Module};
use scvm::signature::{Signature, ValType};

mod utils;
use utils::{init_tracing, load_module_bytes};

#[derive(Parser, Debug)]
#[command(name = "scvm-inspect")]
#[command(about = "Inspect contract modules to understand their structure")]
#[command(long_about = "
SCVM Inspect - contract module inspector

Decodes and validates a module without resolving its imports, then shows
its imports, entry points, memory limits and globals.

Examples:
  # Basic inspection
  scvm-inspect contract.wasm

  # Show only exports
  scvm-inspect contract.wat --exports-only

  # Verbose output with internal details
  scvm-inspect contract.wasm --verbose
")]
struct Args {
    /// Path to the contract module
    wasm_file: PathBuf,

    /// Show only exports
    #[arg(long)]
    exports_only: bool,

    /// Show only imports
    #[arg(long)]
    imports_only: bool,

    /// Show verbose output with internal details
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn format_types(types: &[ValType]) -> String {
    types.iter().map(ValType::to_string).collect::<Vec<_>>().join(", ")
}

fn format_signature(sig: &Signature) -> String {
    if sig.results.is_empty() {
        format!("({})", format_types(&sig.params))
    } else {
        format!("({}) -> ({})", format_types(&sig.params), format_types(&sig.results))
    }
}

fn print_imports(module: &Module) {
    println!("Imports ({}):", module.imports.len());
    let mut func_idx = 0;
    for (import, kind) in &module.imports {
        match kind {
            ExternKind::Func => {
                let sig = format_signature(&module.functions[func_idx].ty);
                let known = if scvm::host::lookup(&import.field).is_some() && import.module == scvm::module::HOST_MODULE { "" } else { "  [unresolved]" };
                println!("  func {}.{} {}{}", import.module, import.field, sig, known);
                func_idx += 1;
            }
            other => println!("  {:?} {}.{}", other, import.module, import.field),
        }
    }
}

fn print_exports(module: &Module, verbose: bool) {
    let mut names: Vec<_> = module.exports.iter().collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    println!("Exports ({}):", names.len());
    for (name, export) in names {
        match export.kind {
            ExternKind::Func => {
                let func = &module.functions[export.idx as usize];
                print!("  func {} {}", name, format_signature(&func.ty));
                if verbose && func.import.is_none() {
                    print!("  body {}..{}, {} locals", func.body.start, func.body.end, func.locals.len() - func.ty.n_params());
                }
                println!();
            }
            kind => println!("  {:?} {} (index {})", kind, name, export.idx),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    let bytes = load_module_bytes(&args.wasm_file)?;
    let size = bytes.len();
    let module = Module::compile(bytes).map_err(|e| format!("Failed to compile module: {}", e))?;

    println!("Module: {} ({} bytes)", args.wasm_file.display(), size);
    if !args.exports_only {
        print_imports(&module);
    }
    if !args.imports_only {
        print_exports(&module, args.verbose);
    }
    if args.exports_only || args.imports_only {
        return Ok(());
    }

    match &module.memory {
        Some(mem) => println!("Memory: {} pages min, {} pages max", mem.min, mem.max),
        None => println!("Memory: none"),
    }
    if let Some(table) = &module.table {
        println!("Table: {} min, {} max", table.min, table.max);
    }
    if !module.globals.is_empty() {
        println!("Globals ({}):", module.globals.len());
        for (i, global) in module.globals.iter().enumerate() {
            let mutability = if global.is_mutable { "mut " } else { "" };
            println!("  [{}] {}{}", i, mutability, global.ty);
        }
    }
    if args.verbose {
        println!("Types: {}", module.types.len());
        println!("Functions: {}", module.functions.len());
        println!("Data segments: {}", module.data_segments.len());
        println!("Element segments: {}", module.elements.len());
        println!("Control blocks: {}", module.side_table.len());
        if let Some(start) = module.start {
            println!("Start function: {}", start);
        }
    }
    Ok(())
}
