//! CLI command implementations

pub mod connector;
pub mod init;
pub mod run;
pub mod validate;
pub mod workflow;

use anyhow::{Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use conflux_core::Config;
use conflux_core::config::CONFIG_FILE;
use conflux_runtime::FailureDetail;

/// Project at `path`; a directory without a conflux.yaml runs on defaults
pub fn load_project(path: &Path) -> Result<Config> {
    if path.is_dir() && !path.join(CONFIG_FILE).exists() {
        tracing::debug!(path = %path.display(), "no project file, using defaults");
        return Ok(Config::standalone(path));
    }
    Config::load(path).with_context(|| format!("Failed to load project at {}", path.display()))
}

/// Token cancelled on Ctrl+C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, cancelling run");
            cancel.cancel();
        }
    });
    token
}

fn print_failures(errors: &[FailureDetail]) {
    for error in errors {
        match &error.stage {
            Some(at) => println!("  ! [{at}] {:?}: {}", error.kind, error.message),
            None => println!("  ! {:?}: {}", error.kind, error.message),
        }
    }
}
