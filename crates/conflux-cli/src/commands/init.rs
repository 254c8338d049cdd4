//! Initialize a new Conflux project

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use conflux_core::config::CONFIG_FILE;

const ORDERS_SOURCE: &str = r#"# Orders exported by the web shop, one JSON object per line
id: orders
name: Orders
type: FileSystem
connectionProperties:
  path: data/orders.jsonl
validationRules:
  - field: id
    rule: required
"#;

const ARCHIVE_DESTINATION: &str = r#"id: archive
name: Order archive
type: FileSystem
connectionProperties:
  path: data/archive.jsonl
  writeMode: overwrite
"#;

const LARGE_ORDERS_DESTINATION: &str = r#"id: large-orders
name: Large orders
type: FileSystem
connectionProperties:
  path: data/large-orders.jsonl
  writeMode: overwrite
"#;

const PIPELINE_REQUEST: &str = r#"# Run with: conflux run pipeline.yaml
source: sources/orders.yaml
destination: destinations/archive.yaml
config:
  transforms:
    - drop: [internal_notes]
    - addFields:
        archived: true
  validation:
    rules:
      - field: total
        rule:
          range: { min: 0 }
"#;

const WORKFLOW: &str = r#"# Run with: conflux workflow run workflows/route-orders.yaml --var threshold=100
id: route-orders
name: Route orders by size
startStepId: extract
variables:
  threshold: 100
steps:
  - id: extract
    type: Extract
    config:
      sourceId: orders
    onSuccess: large
    outputBinding: orders

  - id: large
    type: Transform
    config:
      transforms:
        - filter: { field: total, operator: GreaterThanOrEqual, value: 100 }
    onSuccess: any-large

  - id: any-large
    type: Branch
    config:
      branches:
        - condition: { field: output.count, operator: GreaterThan, value: 0 }
          nextStepId: load-large
      defaultStepId: archive

  - id: load-large
    type: Load
    config:
      destinationId: large-orders
    onSuccess: archive

  - id: archive
    type: Load
    input: orders
    config:
      destinationId: archive
"#;

const SAMPLE_ORDERS: &str = r#"{"id": 1, "customer": "ada", "total": 42.5, "internal_notes": "gift wrap"}
{"id": 2, "customer": "grace", "total": 180.0, "internal_notes": ""}
{"id": 3, "customer": "linus", "total": 12.0}
{"id": 4, "customer": "barbara", "total": 250.75}
"#;

const GITIGNORE: &str = r#"# Conflux run output
data/archive.jsonl
data/large-orders.jsonl

# IDE
.idea/
.vscode/
*.swp
"#;

/// Scaffold a project at `path`
pub fn run(path: &Path, name: Option<&str>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    let abs_path = path.canonicalize()?;

    let project_name = match name {
        Some(n) => n.to_string(),
        None => abs_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Could not determine project name from path"))?,
    };

    if path.join(CONFIG_FILE).exists() {
        anyhow::bail!("Directory '{}' already contains a {CONFIG_FILE}", path.display());
    }

    tracing::info!(project = %project_name, "creating project");

    let config = format!(
        r#"# Conflux project configuration
name: {project_name}
version: "0.1.0"

# Outbound call policy, per target overrides under `targets`
resilience:
  maxAttempts: 3
  baseDelayMs: 200
  maxDelayMs: 10000
  timeoutMs: 30000
  failureThreshold: 5
  coolDownMs: 30000

pipeline:
  batchSize: 500
  continueOnError: false

workflow:
  maxStepExecutions: 1000

# Base context for every workflow run
vars:
  environment: development
"#
    );

    let files: [(&str, &str); 7] = [
        (CONFIG_FILE, &config),
        ("sources/orders.yaml", ORDERS_SOURCE),
        ("destinations/archive.yaml", ARCHIVE_DESTINATION),
        ("destinations/large-orders.yaml", LARGE_ORDERS_DESTINATION),
        ("pipeline.yaml", PIPELINE_REQUEST),
        ("workflows/route-orders.yaml", WORKFLOW),
        ("data/orders.jsonl", SAMPLE_ORDERS),
    ];
    for (relative, contents) in files {
        let target = path.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    fs::write(path.join(".gitignore"), GITIGNORE)?;

    println!("✓ Created project '{}' at {}", project_name, abs_path.display());
    println!();
    println!("Next steps:");
    if path != Path::new(".") {
        println!("  cd {}", path.display());
    }
    println!("  conflux validate                   # Check configuration");
    println!("  conflux run pipeline.yaml          # Archive the sample orders");
    println!("  conflux workflow run workflows/route-orders.yaml");

    Ok(())
}
