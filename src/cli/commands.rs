//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::CrossTestConfig;

use super::{CliError, CliResult, ExitCode};

/// Load the config, rendering failures as miette diagnostics.
pub fn load_config(path: Option<&Path>) -> CliResult<CrossTestConfig> {
    CrossTestConfig::load(path).map_err(|err| CliError::failure(format!("{:?}", miette::Report::new(err))))
}

pub fn print_config(path: Option<&Path>) -> CliResult<ExitCode> {
    let config = load_config(path)?;
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| CliError::failure(format!("Error: could not serialize config: {e}")))?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

pub fn clean(path: Option<&Path>) -> CliResult<ExitCode> {
    let config = load_config(path)?;
    match remove_dist_root(&config.dist_root) {
        Ok(true) => println!("removed {}", config.dist_root.display()),
        Ok(false) => println!("nothing to clean at {}", config.dist_root.display()),
        Err(e) => {
            return Err(CliError::failure(format!(
                "Error: could not remove {}: {e}",
                config.dist_root.display()
            )));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Remove `dist_root` recursively. Returns `false` when it did not exist.
fn remove_dist_root(dist_root: &Path) -> std::io::Result<bool> {
    match fs::remove_dir_all(dist_root) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
