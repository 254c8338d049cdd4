//! Connector commands

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use conflux_core::definitions::load_document;
use conflux_core::{DestinationDefinition, SourceDefinition};
use conflux_runtime::Engine;
use conflux_runtime::requests::DESTINATIONS_DIR;

use super::load_project;

/// Check that the system a definition points at is reachable
///
/// Documents under `destinations/` are read as destinations first; anything
/// else as a source first.
pub async fn test(project: &Path, definition: &Path) -> Result<()> {
    let config = load_project(project)?;
    let engine = Engine::new(&config);
    let document: Value = load_document(definition)
        .with_context(|| format!("Failed to load definition {}", definition.display()))?;

    let destination_first = definition
        .parent()
        .and_then(|dir| dir.file_name())
        .is_some_and(|name| name == DESTINATIONS_DIR);
    let as_source = serde_json::from_value::<SourceDefinition>(document.clone());
    let as_destination = serde_json::from_value::<DestinationDefinition>(document);

    let (id, reachable) = match (as_source, as_destination) {
        (Ok(source), Err(_)) => (source.id.clone(), engine.test_source(&source).await?),
        (_, Ok(destination)) if destination_first => {
            (destination.id.clone(), engine.test_destination(&destination).await?)
        }
        (Ok(source), Ok(_)) => (source.id.clone(), engine.test_source(&source).await?),
        (Err(_), Ok(destination)) => {
            (destination.id.clone(), engine.test_destination(&destination).await?)
        }
        (Err(e), Err(_)) => {
            return Err(e).context(format!(
                "{} is not a source or destination definition",
                definition.display()
            ));
        }
    };

    if !reachable {
        anyhow::bail!("connector '{id}' is not reachable");
    }
    println!("✓ Connector '{id}' is reachable");
    Ok(())
}
