//! Warden CLI
//!
//! Operator interface to the shared pipeline store: start runs, inspect their
//! state, release stuck leases and retry failed steps.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use warden_core::domain::pipeline::PipelineKind;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden pipeline coordination CLI", long_about = None)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Project (tenant) every command runs in
    #[arg(long, env = "WARDEN_PROJECT_ID")]
    project: Uuid,

    /// Pipeline kind: schema_discovery or ontology_workflow
    #[arg(long, env = "PIPELINE_KIND", default_value = "schema_discovery")]
    kind: PipelineKind,

    /// Print JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden_coordinator=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config {
        database_url: cli.database_url,
        project_id: cli.project,
        pipeline_kind: cli.kind,
        json: cli.json,
    };

    handle_command(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const PROJECT: &str = "6f1c2a4e-9d3b-4c8e-8a51-2f6d7b0e3c19";
    const RESOURCE: &str = "0b7e4d2c-1a9f-4e63-b8d5-7c2a9e1f6d40";

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["warden", "--database-url", "postgres://localhost/warden", "--project", PROJECT];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_kind_defaults_to_schema_discovery() {
        let cli = parse(&["pipeline", "latest", RESOURCE]);
        assert_eq!(cli.kind, PipelineKind::SchemaDiscovery);
        assert!(!cli.json);
    }

    #[test]
    fn test_kind_and_json_flags() {
        let cli = parse(&["--kind", "ontology-workflow", "pipeline", "active", RESOURCE, "--json"]);
        assert_eq!(cli.kind, PipelineKind::OntologyWorkflow);
        assert!(cli.json);
    }

    #[test]
    fn test_start_takes_fingerprint_and_force() {
        let cli = parse(&["pipeline", "start", RESOURCE, "-f", "abc123", "--force"]);
        match cli.command {
            Commands::Pipeline {
                command:
                    commands::PipelineCommands::Start {
                        resource,
                        fingerprint,
                        force,
                    },
            } => {
                assert_eq!(resource.to_string(), RESOURCE);
                assert_eq!(fingerprint.as_deref(), Some("abc123"));
                assert!(force);
            }
            _ => panic!("expected pipeline start"),
        }
    }

    #[test]
    fn test_retry_defaults() {
        let cli = parse(&["node", "retry", RESOURCE]);
        match cli.command {
            Commands::Node {
                command:
                    commands::NodeCommands::Retry {
                        max_retries,
                        stale_after,
                        ..
                    },
            } => {
                assert_eq!(max_retries, 3);
                assert_eq!(stale_after, None);
            }
            _ => panic!("expected node retry"),
        }
    }

    #[test]
    fn test_rejects_unknown_kind_and_bad_ids() {
        let base = ["warden", "--database-url", "postgres://localhost/warden", "--project", PROJECT];
        let mut bad_kind = base.to_vec();
        bad_kind.extend(["--kind", "batch", "pipeline", "latest", RESOURCE]);
        assert!(Cli::try_parse_from(bad_kind).is_err());

        let mut bad_id = base.to_vec();
        bad_id.extend(["pipeline", "show", "not-a-uuid"]);
        assert!(Cli::try_parse_from(bad_id).is_err());
    }
}
