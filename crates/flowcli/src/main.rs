// crates/flowcli/src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    Command, GraphConfig, GraphEvent, NodeConfig, NodeType, Value, WorkflowConfig,
};
use flowruntime::{FlowRuntime, GraphRun, RuntimeConfig};
use futures::StreamExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration (TOML, `[engine]` table)
    #[arg(short, long, global = true, env = "FLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override `engine.max_workers`
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Override `engine.max_execution_steps`
    #[arg(long, global = true)]
    max_steps: Option<u64>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Route pause/abort commands through an Iggy server
    #[cfg(feature = "iggy")]
    #[arg(long, global = true, env = "FLOW_IGGY_URL")]
    iggy: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Ctrl-C pauses the run instead of aborting it
        #[arg(long)]
        pause_on_interrupt: bool,

        /// Where to write the snapshot if the run pauses
        #[arg(long, default_value = "snapshot.json")]
        snapshot_out: PathBuf,
    },

    /// Continue a paused run from its snapshot
    Resume {
        /// Workflow the snapshot was taken from
        #[arg(short, long)]
        file: PathBuf,

        /// Snapshot written by a paused `run`
        #[arg(short, long)]
        snapshot: PathBuf,

        #[arg(long, default_value = "snapshot.json")]
        snapshot_out: PathBuf,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(max_workers) = cli.max_workers {
        config.engine.max_workers = max_workers;
    }
    if let Some(max_steps) = cli.max_steps {
        config.engine.max_execution_steps = max_steps;
    }
    let transport = cli_transport(&cli).await?;

    match cli.command {
        Commands::Run {
            file,
            input,
            pause_on_interrupt,
            snapshot_out,
        } => {
            let runtime = build_runtime(config, &transport);
            let workflow = load_workflow(&file)?;
            let inputs = parse_inputs(input.as_deref())?;

            println!("🚀 Workflow: {} ({})", workflow.name, workflow.id);
            println!("   Nodes: {}", workflow.graph.nodes.len());
            println!("   Edges: {}", workflow.graph.edges.len());
            println!();

            let run = runtime.start(&workflow, inputs)?;
            tracing::info!(
                run_id = %run.run_id(),
                workflow = %workflow.id,
                pause_on_interrupt,
                "Run started"
            );
            drive(&runtime, run, pause_on_interrupt, &snapshot_out).await?;
        }

        Commands::Resume {
            file,
            snapshot,
            snapshot_out,
        } => {
            let runtime = build_runtime(config, &transport);
            let workflow = load_workflow(&file)?;
            let graph = runtime.build_graph(&workflow.graph)?;
            let snapshot = std::fs::read_to_string(&snapshot)
                .with_context(|| format!("reading snapshot {}", snapshot.display()))?;

            println!("⏯️  Resuming workflow: {}", workflow.name);
            let run = runtime.resume(graph, &snapshot)?;
            tracing::info!(run_id = %run.run_id(), workflow = %workflow.id, "Run resumed");
            drive(&runtime, run, false, &snapshot_out).await?;
        }

        Commands::Validate { file } => {
            let runtime = build_runtime(config, &None);
            validate_workflow(&runtime, &file)?;
        }

        Commands::Nodes => {
            list_nodes(&build_runtime(config, &None));
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: RuntimeConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        max_workers = config.engine.max_workers,
        "Loaded runtime config"
    );
    Ok(config)
}

fn load_workflow(path: &Path) -> Result<WorkflowConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing workflow {}", path.display()))
}

fn parse_inputs(input: Option<&str>) -> Result<BTreeMap<String, Value>> {
    let Some(input) = input else {
        return Ok(BTreeMap::new());
    };
    match serde_json::from_str(input).context("input is not valid JSON")? {
        serde_json::Value::Object(obj) => Ok(obj
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

type Transport = Option<Arc<dyn flowcore::CommandTransport>>;

#[cfg(feature = "iggy")]
async fn cli_transport(cli: &Cli) -> Result<Transport> {
    use flowcore::commands::{IggyCommandConfig, IggyCommandTransport};

    let Some(url) = cli.iggy.clone() else {
        return Ok(None);
    };
    let config = IggyCommandConfig {
        connection_string: url,
        ..Default::default()
    };
    let transport = IggyCommandTransport::connect(config).await?;
    Ok(Some(Arc::new(transport)))
}

#[cfg(not(feature = "iggy"))]
async fn cli_transport(_cli: &Cli) -> Result<Transport> {
    Ok(None)
}

fn build_runtime(config: RuntimeConfig, transport: &Transport) -> FlowRuntime {
    let runtime = FlowRuntime::with_registry(Arc::new(flownodes::standard_registry()), config);
    match transport {
        Some(transport) => runtime.with_command_transport(transport.clone()),
        None => runtime,
    }
}

/// Print a run's events until it finishes. Ctrl-C becomes an abort (or a
/// pause) command addressed to the run.
async fn drive(
    runtime: &FlowRuntime,
    mut run: GraphRun,
    pause_on_interrupt: bool,
    snapshot_out: &Path,
) -> Result<()> {
    let run_id = run.run_id();
    let sender = runtime.command_sender();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = run.next() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let command = if pause_on_interrupt {
                    Command::pause("interrupted")
                } else {
                    Command::abort("interrupted")
                };
                tracing::info!(%run_id, ?command, "Interrupted, forwarding command to the run");
                println!("🛑 Sending {:?}", command);
                sender.send(run_id, command).await;
                continue;
            }
        };
        let Some(event) = event else {
            bail!("run {} ended without a result", run_id);
        };

        match event {
            GraphEvent::WorkflowRunStarted { run_id, .. } => {
                println!("▶️  Run {} started", run_id);
            }
            GraphEvent::NodeRunStarted { execution, .. } => {
                println!("  ⚡ Starting node: {} ({})", execution.node_id, execution.node_type);
            }
            GraphEvent::NodeRunSucceeded { execution, .. } => {
                println!(
                    "  ✅ Node {} completed in {}ms",
                    execution.node_id, execution.elapsed_ms
                );
            }
            GraphEvent::NodeRunFailed { execution, .. } => {
                println!(
                    "  ❌ Node {} failed: {}",
                    execution.node_id,
                    execution.error.unwrap_or_default()
                );
            }
            GraphEvent::NodeRunException { execution, .. } => {
                println!(
                    "  ⚠️  Node {} failed, continuing: {}",
                    execution.node_id,
                    execution.error.unwrap_or_default()
                );
            }
            GraphEvent::NodeRunRetry {
                execution,
                retry_index,
                ..
            } => {
                println!("  🔁 Retrying node {} (#{})", execution.node_id, retry_index);
            }
            GraphEvent::NodeRunStreamChunk {
                response_node_id,
                chunk,
                is_final,
                ..
            } => {
                println!("  💬 {}: {:?}{}", response_node_id, chunk, if is_final { " (end)" } else { "" });
            }
            GraphEvent::LoopNext { node_id, index, .. } => {
                println!("  🔄 Loop {} round {}", node_id, index);
            }
            GraphEvent::IterationStarted { node_id, total, .. } => {
                println!("  🔄 Iteration {} over {} items", node_id, total);
            }
            GraphEvent::LoopFailed { node_id, error, .. }
            | GraphEvent::IterationFailed { node_id, error, .. } => {
                println!("  ❌ {} failed: {}", node_id, error);
            }
            GraphEvent::WorkflowRunSucceeded {
                outputs,
                exceptions_count,
                ..
            } => {
                println!();
                if exceptions_count > 0 {
                    println!("✨ Workflow completed with {} handled failures", exceptions_count);
                } else {
                    println!("✨ Workflow completed successfully");
                }
                print_outputs(&outputs);
                tracing::info!(%run_id, exceptions_count, "Run succeeded");
                return Ok(());
            }
            GraphEvent::WorkflowRunFailed { error, node_id, .. } => {
                tracing::info!(%run_id, node_id = ?node_id, "Run failed");
                return Err(match node_id {
                    Some(node_id) => anyhow!("💥 Workflow failed at {}: {}", node_id, error),
                    None => anyhow!("💥 Workflow failed: {}", error),
                });
            }
            GraphEvent::WorkflowRunStopped { reason, .. } => {
                tracing::info!(%run_id, reason = ?reason, "Run stopped");
                bail!("Workflow stopped: {}", reason.unwrap_or_else(|| "aborted".to_string()));
            }
            GraphEvent::WorkflowRunPaused { snapshot, .. } => {
                std::fs::write(snapshot_out, snapshot)
                    .with_context(|| format!("writing snapshot {}", snapshot_out.display()))?;
                tracing::info!(%run_id, path = %snapshot_out.display(), "Run paused");
                println!("⏸️  Workflow paused, snapshot saved to {}", snapshot_out.display());
                return Ok(());
            }
            _ => {}
        }
    }
}

fn print_outputs(outputs: &BTreeMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    println!();
    println!("📤 Outputs:");
    for (key, value) in outputs {
        println!("   {}: {}", key, value);
    }
}

fn validate_workflow(runtime: &FlowRuntime, file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    let graph = runtime.build_graph(&workflow.graph)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", graph.node_count());
    println!("   Edges: {}", graph.edges().len());
    println!("   Root: {}", graph.root_id());

    Ok(())
}

fn list_nodes(runtime: &FlowRuntime) {
    println!("📦 Available Node Types:");
    println!();

    let registry = runtime.registry();
    for node_type in registry.list_node_types() {
        match registry.get_metadata(node_type) {
            Some(metadata) => {
                println!("  • {} ({})", node_type, metadata.category);
                println!("    {}", metadata.description);
            }
            None => println!("  • {}", node_type),
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let graph = GraphConfig::new()
        .with_node(NodeConfig::new("start", NodeType::Start).with_title("Start").with_data(
            "variables",
            json!([{ "variable": "name", "required": true }]),
        ))
        .with_node(
            NodeConfig::new("greet", NodeType::TemplateTransform)
                .with_title("Greeting")
                .with_data("template", json!("Hello, {{ name }}!"))
                .with_data(
                    "variables",
                    json!([{ "variable": "name", "value_selector": ["start", "name"] }]),
                ),
        )
        .with_node(NodeConfig::new("end", NodeType::End).with_title("End").with_data(
            "outputs",
            json!([{ "variable": "greeting", "value_selector": ["greet", "output"] }]),
        ))
        .with_edge("start", "greet")
        .with_edge("greet", "end");

    let workflow = WorkflowConfig::new("hello", "Hello workflow", graph);
    let text = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, text).with_context(|| format!("writing {}", output.display()))?;

    println!("✅ Created example workflow: {}", output.display());
    println!("   Run it with: flow run -f {} -i '{{\"name\": \"Ada\"}}'", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_must_be_a_json_object() {
        let inputs = parse_inputs(Some(r#"{"name": "Ada", "age": 36}"#)).unwrap();
        assert_eq!(inputs["name"], Value::from("Ada"));
        assert_eq!(inputs["age"].as_i64(), Some(36));
        assert!(parse_inputs(Some("[1, 2]")).is_err());
        assert!(parse_inputs(None).unwrap().is_empty());
    }

    #[test]
    fn config_file_overrides_engine_defaults() {
        let path = std::env::temp_dir().join(format!("flow-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[engine]\nmax_workers = 3\nmin_workers = 2\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.engine.max_workers, 3);
        assert_eq!(config.engine.min_workers, 2);
        assert!(load_config(Some(Path::new("/nonexistent/flow.toml"))).is_err());
    }
}
