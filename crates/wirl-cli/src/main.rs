//! `runner` — executes a single `.wirl` file locally (spec.md §6): `runner
//! <path/to/file.wirl> --functions <module> [--param K=V]...`. Prints the
//! final channel map as JSON on success; exits non-zero on failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use wirl_engine::checkpoint::SharedCheckpointStore;
use wirl_engine::{CallableResolver, CancelFlag, Engine, EngineOutcome, ExecutorConfig, FileCheckpointStore};
use wirl_orchestrator::PostgresCheckpointStore;

mod resolver;

use resolver::SubprocessModuleResolver;

/// Runs one WIRL workflow to completion (or suspension) against a
/// subprocess-backed callable module, mirroring the teacher's single-shot
/// `runner` binaries that drive a workflow without a server attached.
#[derive(Parser, Debug)]
#[command(name = "runner", about = "Execute a single .wirl workflow locally")]
struct Args {
    /// Path to the .wirl file to compile and run.
    path: PathBuf,

    /// Python module backing every callable the workflow invokes
    /// (`python3 -m <module>`, one spawn per node call).
    #[arg(long)]
    functions: String,

    /// `key=value` input pairs, repeatable. Values are parsed as JSON when
    /// possible, otherwise kept as a string.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected K=V, got '{raw}'"))?;
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let source = std::fs::read_to_string(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let workflow = wirl_dsl::compile(&source).map_err(|errors| {
        let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        anyhow::anyhow!("workflow failed to compile: {joined}")
    })?;

    let checkpoints: SharedCheckpointStore = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            wirl_orchestrator::run_migrations(&pool).await.context("failed to run migrations")?;
            Arc::new(PostgresCheckpointStore::new(pool))
        }
        Err(_) => {
            let dir = std::env::var("WORKFLOW_CHECKPOINT_DIR").unwrap_or_else(|_| ".wirl-checkpoints".to_string());
            std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir}"))?;
            Arc::new(FileCheckpointStore::new(dir))
        }
    };

    let resolver: Arc<dyn CallableResolver> = Arc::new(SubprocessModuleResolver::new(args.functions.clone()));
    let engine = Engine::new(checkpoints, resolver, ExecutorConfig::default());

    let inputs: Map<String, Value> = args.params.into_iter().collect();
    let configurable = Map::new();
    let run_id = Uuid::now_v7();
    let cancel = CancelFlag::new();

    let outcome = engine
        .start(&workflow, run_id, inputs, configurable, &cancel)
        .await
        .context("run failed")?;

    match outcome {
        EngineOutcome::Completed { result } => {
            print_channels(&result);
            Ok(())
        }
        EngineOutcome::Suspended { hitl } => {
            eprintln!(
                "run {run_id} suspended awaiting human input at node '{}'; resume with the same run id once a resolver is available",
                hitl.node
            );
            std::process::exit(2);
        }
        EngineOutcome::Canceled => {
            bail!("run {run_id} was canceled");
        }
    }
}

fn print_channels(result: &BTreeMap<String, Value>) {
    let json = serde_json::to_string_pretty(result).expect("channel map is always representable as JSON");
    println!("{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_valued_params() {
        let (key, value) = parse_param("rounds=3").unwrap();
        assert_eq!(key, "rounds");
        assert_eq!(value, serde_json::json!(3));
    }

    #[test]
    fn falls_back_to_string_for_non_json_values() {
        let (key, value) = parse_param("name=alice").unwrap();
        assert_eq!(key, "name");
        assert_eq!(value, serde_json::json!("alice"));
    }

    #[test]
    fn rejects_params_without_equals() {
        assert!(parse_param("rounds").is_err());
    }

    #[test]
    fn parses_object_and_array_values() {
        let (_, value) = parse_param(r#"opts={"retries":2}"#).unwrap();
        assert_eq!(value, serde_json::json!({"retries": 2}));
    }
}
