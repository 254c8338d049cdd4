//! Validate configuration command

use anyhow::{Context, Result};
use std::path::Path;

use conflux_core::{Config, ConnectorRegistry};
use conflux_runtime::requests::WORKFLOWS_DIR;
use conflux_runtime::{Definitions, load_workflow_request};

use super::workflow::check;

/// Load the project and check every definition and workflow in it
pub fn run(project: &Path) -> Result<()> {
    let config = Config::load(project).context("Failed to load configuration")?;
    println!("✓ Project: {}", config.project.name);
    println!("✓ Version: {}", config.project.version);
    println!("✓ Schemas: {}", config.project.schemas.len());

    let definitions = Definitions::from_project(&config).context("Failed to load definitions")?;
    let registry = ConnectorRegistry::with_defaults();
    let base = Some(config.base_path.as_path());
    let mut problems = 0;

    for source in &definitions.sources {
        match registry.source(source, base) {
            Ok(connector) => println!("✓ Source '{}' ({})", source.id, connector.target()),
            Err(e) => {
                problems += 1;
                println!("✗ Source '{}': {e}", source.id);
            }
        }
    }
    for destination in &definitions.destinations {
        match registry.destination(destination, base) {
            Ok(connector) => println!("✓ Destination '{}' ({})", destination.id, connector.target()),
            Err(e) => {
                problems += 1;
                println!("✗ Destination '{}': {e}", destination.id);
            }
        }
    }

    for path in config.documents(WORKFLOWS_DIR)? {
        let checked = load_workflow_request(&path).and_then(|mut request| {
            request.definitions.merge(definitions.clone());
            check(&request).map(|()| request.workflow.id)
        });
        match checked {
            Ok(id) => println!("✓ Workflow '{id}'"),
            Err(e) => {
                problems += 1;
                println!("✗ Workflow {}: {e}", path.display());
            }
        }
    }

    if problems > 0 {
        anyhow::bail!("{problems} problem(s) found");
    }
    println!("✓ Configuration is valid");
    Ok(())
}
