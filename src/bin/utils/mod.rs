use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Reads a module from disk, compiling it first when it is a `.wat` file.
pub fn load_module_bytes(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if path.extension().and_then(|s| s.to_str()) == Some("wat") {
        tracing::debug!(path = %path.display(), "compiling text module");
        return wat::parse_file(path).map_err(|e| format!("Failed to compile WAT file: {}", e).into());
    }
    fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e).into())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over `--debug`.
pub fn init_tracing(debug: bool) {
    let fallback = if debug { "scvm=trace" } else { "scvm=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
