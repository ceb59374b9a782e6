use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::AppConfig;
use stepwise_core::traits::RunStore;
use stepwise_engine::types::{BasicType, TypeDescriptor};
use stepwise_engine::workflow::{self, WorkflowConfig};
use stepwise_engine::{Orchestrator, WorkflowHeartbeat, WorkflowRuntime};
use stepwise_llm::EchoClient;
use stepwise_store::SqliteStore;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Declarative LLM workflow engine")]
struct Cli {
    /// Path to engine config file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and print its final state as JSON
    Run {
        /// Workflow file (.yaml, .yml or .json)
        workflow: PathBuf,
        /// Initial state value; VALUE is parsed as JSON unless the field is a str
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
        /// JSON object file with initial state values
        #[arg(long)]
        inputs_file: Option<PathBuf>,
        /// Answer every LLM call offline with the echo provider
        #[arg(long)]
        dry_run: bool,
        /// Do not record the run in the run database
        #[arg(long)]
        no_store: bool,
    },
    /// Check a workflow through graph compilation without running it
    Validate {
        workflow: PathBuf,
    },
    /// Print the compiled node and transition table
    Graph {
        workflow: PathBuf,
    },
    /// List stored runs of a workflow
    Runs {
        /// Workflow name (flow.name)
        workflow_name: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List live registered instances of a workflow
    Instances {
        workflow_name: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err("input key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

/// Type a `--input` value. Fields declared `str` keep the raw text; anything
/// else is parsed as JSON, falling back to a string.
fn coerce_inputs(raw: Vec<(String, String)>, wf: Option<&WorkflowConfig>) -> Vec<(String, Value)> {
    raw.into_iter()
        .map(|(key, value)| {
            let declared = wf.and_then(|w| w.state.fields.get(&key)).map(|f| &f.ty);
            let value = match declared {
                Some(TypeDescriptor::Basic(BasicType::Str)) => Value::String(value),
                _ => serde_json::from_str(&value).unwrap_or(Value::String(value)),
            };
            (key, value)
        })
        .collect()
}

/// Runtime for `run`. A dry run answers every node with the echo client,
/// whatever provider the workflow configures.
fn runtime_for(config: AppConfig, dry_run: bool) -> WorkflowRuntime {
    let runtime = WorkflowRuntime::new(config);
    if dry_run {
        info!("Dry run: LLM calls are answered by the echo client");
        return runtime.with_llm(Arc::new(EchoClient::new()));
    }
    runtime
}

fn init_tracing(workflow_level: Option<&str>) {
    let fallback = match workflow_level {
        Some(level) => format!("stepwise={},stepwise_engine={},warn", level, level),
        None => "stepwise=info,stepwise_engine=info,warn".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_app_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".stepwise").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => Ok(AppConfig::load(&p)?),
        _ => Ok(AppConfig::from_env()),
    }
}

/// Run database path and whether storage is on, workflow settings over engine config.
fn storage_for(app: &AppConfig, wf: Option<&WorkflowConfig>) -> Option<PathBuf> {
    let settings = wf.and_then(|w| w.config.storage.as_ref());
    let enabled = settings
        .and_then(|s| s.enabled)
        .unwrap_or(app.storage.enabled);
    if !enabled {
        return None;
    }
    Some(match settings.and_then(|s| s.path.as_ref()) {
        Some(p) => PathBuf::from(p),
        None => app.storage_path(),
    })
}

fn read_inputs(
    inputs: Vec<(String, Value)>,
    inputs_file: Option<&Path>,
) -> anyhow::Result<Map<String, Value>> {
    let mut map = match inputs_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read inputs file {}", path.display()))?;
            match serde_json::from_str(&content)? {
                Value::Object(map) => map,
                other => anyhow::bail!("inputs file must hold a JSON object, got {}", other),
            }
        }
        None => Map::new(),
    };
    map.extend(inputs);
    Ok(map)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    // Workflow log level applies only when RUST_LOG is unset; a document that
    // fails to load here is reported properly by the command itself.
    let workflow_doc = match cli.command {
        Commands::Run { ref workflow, .. }
        | Commands::Validate { ref workflow }
        | Commands::Graph { ref workflow } => workflow::load(workflow).ok(),
        _ => None,
    };
    init_tracing(
        workflow_doc
            .as_ref()
            .and_then(|w| w.config.observability.log_level.as_deref()),
    );

    let config = load_app_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            workflow,
            inputs,
            inputs_file,
            dry_run,
            no_store,
        } => {
            let inputs = read_inputs(
                coerce_inputs(inputs, workflow_doc.as_ref()),
                inputs_file.as_deref(),
            )?;

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Cancelling run...");
                cancel_clone.cancel();
            });

            let store = match storage_for(&config, workflow_doc.as_ref()) {
                Some(path) if !no_store => Some(Arc::new(SqliteStore::open(&path)?)),
                _ => None,
            };

            let mut heartbeat = None;
            if let (true, Some(store), Some(doc)) =
                (config.registry.enabled, store.as_ref(), workflow_doc.as_ref())
            {
                let hb_cancel = cancel.child_token();
                let hb = WorkflowHeartbeat::from_config(
                    store.clone(),
                    &doc.flow.name,
                    &doc.flow.version,
                    &config.registry,
                    hb_cancel.clone(),
                );
                heartbeat = Some((hb_cancel, tokio::spawn(hb.run())));
            }

            let mut runtime = runtime_for(config, dry_run).with_cancellation(cancel);
            if let Some(ref store) = store {
                runtime = runtime.with_store(store.clone());
            }

            let result = runtime.run_workflow(&workflow, inputs).await;

            if let Some((hb_cancel, handle)) = heartbeat {
                hb_cancel.cancel();
                if let Err(e) = handle.await {
                    warn!(error = %e, "Heartbeat task ended abnormally");
                }
            }

            let outcome = result?;
            info!(
                run_id = %outcome.run_id,
                steps = outcome.node_results.len(),
                input_tokens = outcome.usage.input_tokens,
                output_tokens = outcome.usage.output_tokens,
                elapsed_ms = outcome.elapsed_ms,
                "Run finished"
            );
            println!("{}", serde_json::to_string_pretty(&Value::Object(outcome.state))?);
        }
        Commands::Validate { workflow } => {
            let runtime = WorkflowRuntime::new(config);
            if !runtime.validate_workflow(&workflow) {
                anyhow::bail!("{} is not a valid workflow", workflow.display());
            }
            println!("{} is valid", workflow.display());
        }
        Commands::Graph { workflow } => {
            let runtime = WorkflowRuntime::new(config);
            let doc = runtime.load(&workflow)?;
            let graph = runtime.compile(&doc)?;
            print!("{}", graph.describe());
        }
        Commands::Runs {
            workflow_name,
            limit,
        } => {
            let store = SqliteStore::open(&config.storage_path())?;
            let runs = store.list_by_workflow(&workflow_name, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded for '{}'", workflow_name);
            }
            for run in runs {
                println!(
                    "{}  {:<9}  {}  {}",
                    run.run_id,
                    run.status,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.error.unwrap_or_default()
                );
            }
        }
        Commands::Instances { workflow_name } => {
            let store = Arc::new(SqliteStore::open(&config.storage_path())?);
            let orchestrator = Orchestrator::new(store);
            let live = orchestrator.discover(&workflow_name).await?;
            if live.is_empty() {
                println!("No live instances of '{}'", workflow_name);
            }
            for entry in live {
                println!(
                    "{}  v{}  {}  last heartbeat {}",
                    entry.instance_id,
                    entry.version,
                    entry.endpoint.as_deref().unwrap_or("-"),
                    entry.last_heartbeat.format("%H:%M:%S")
                );
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}
