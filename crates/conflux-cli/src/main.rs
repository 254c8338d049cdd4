//! Conflux CLI
//!
//! Developer tool for running pipelines and workflows locally.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Conflux - ETL execution engine
#[derive(Parser)]
#[command(name = "conflux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory or conflux.yaml path
    #[arg(short, long, default_value = ".", env = "CONFLUX_PROJECT")]
    project: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new Conflux project
    Init {
        /// Directory to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Project name (defaults to directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run a pipeline request
    Run {
        /// Pipeline request document
        request: PathBuf,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run or check workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Check connector definitions
    Connector {
        #[command(subcommand)]
        command: ConnectorCommands,
    },

    /// Validate the project without running anything
    Validate,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Run a workflow document or workflow request
    Run {
        /// Workflow or workflow request document
        file: PathBuf,

        /// Context variable, repeatable (`--var region=EU --var limit=10`)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a workflow graph and the definitions it refers to
    Validate {
        /// Workflow or workflow request document
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConnectorCommands {
    /// Test connectivity for a source or destination definition
    Test {
        /// Definition document
        definition: PathBuf,
    },
}

/// `key=value`; the value is parsed as JSON when it can be
fn parse_var(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    match cli.command {
        Commands::Init { path, name } => {
            commands::init::run(&path, name.as_deref())?;
        }
        Commands::Run { request, json } => {
            commands::run::run(&cli.project, &request, json).await?;
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Run { file, vars, json } => {
                commands::workflow::run(&cli.project, &file, vars, json).await?;
            }
            WorkflowCommands::Validate { file } => {
                commands::workflow::validate(&cli.project, &file)?;
            }
        },
        Commands::Connector { command } => match command {
            ConnectorCommands::Test { definition } => {
                commands::connector::test(&cli.project, &definition).await?;
            }
        },
        Commands::Validate => {
            commands::validate::run(&cli.project)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("region=EU", "region", json!("EU"))]
    #[case("limit=10", "limit", json!(10))]
    #[case("dry=true", "dry", json!(true))]
    #[case("tags=[\"a\",\"b\"]", "tags", json!(["a", "b"]))]
    #[case("expr=a=b", "expr", json!("a=b"))]
    fn test_parse_var(#[case] raw: &str, #[case] key: &str, #[case] value: Value) {
        assert_eq!(parse_var(raw).unwrap(), (key.to_string(), value));
    }

    #[rstest]
    #[case("novalue")]
    #[case("=x")]
    fn test_parse_var_rejects(#[case] raw: &str) {
        assert!(parse_var(raw).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
