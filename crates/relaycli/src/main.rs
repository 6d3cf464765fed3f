// crates/relaycli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaycore::{EventKind, Graph, JsonFileRunStore, NodeKind, NodeSpec, RunNotice, RunStore};
use relayengine::{EdgeGuard, RuntimeConfig, WorkflowEngine};
use relaysteps::{ChatModel, EchoChatModel, OpenAiChatModel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run input as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Persist runs as JSON files in this directory
        #[arg(long)]
        store: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compile a graph file and show its plan
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available capabilities
    Nodes,

    /// List runs persisted in a store directory
    Runs {
        /// Store directory
        store: PathBuf,
    },

    /// Create a new example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn chat_model() -> Arc<dyn ChatModel> {
    match OpenAiChatModel::from_env() {
        Some(model) => Arc::new(model),
        None => Arc::new(EchoChatModel),
    }
}

fn load_graph(file: &Path) -> Result<Graph> {
    let graph_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let graph: Graph = serde_json::from_str(&graph_json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(graph)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            store,
            verbose,
        } => {
            init_logging(verbose);
            run_graph(file, input, config, store).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_graph(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Runs { store } => {
            init_logging(false);
            list_runs(store).await?;
        }

        Commands::Init { output } => {
            create_example_graph(output)?;
        }
    }

    Ok(())
}

fn print_notice(notice: RunNotice) {
    let event = match notice {
        RunNotice::Event(event) => event,
        RunNotice::Lagged(skipped) => {
            println!("  ⚠️  {} events missed", skipped);
            return;
        }
    };
    let node = event
        .node_id
        .as_ref()
        .map(|n| n.to_string())
        .unwrap_or_default();
    match event.kind {
        EventKind::RunStarted => println!("▶️  Run started"),
        EventKind::NodeStarted => println!("  ⚡ Starting node: {}", node),
        EventKind::NodeProgress => {
            let percent = event.payload["progress"].as_f64().unwrap_or(0.0) * 100.0;
            match event.payload["message"].as_str() {
                Some(msg) => println!("     📊 [{}] {:.0}% - {}", node, percent, msg),
                None => println!("     📊 [{}] {:.0}%", node, percent),
            }
        }
        EventKind::NodeCompleted => println!("  ✅ Node {} completed", node),
        EventKind::NodeFailed => {
            println!("  ❌ Node {} failed: {}", node, event.payload["error"])
        }
        EventKind::NodeCancelled => println!("  ⏹️  Node {} cancelled", node),
        EventKind::RunCompleted => println!("✨ Run completed"),
        EventKind::RunFailed => println!("💥 Run failed"),
        EventKind::RunCancelled => println!("⏹️  Run cancelled"),
        EventKind::RunCreated => {}
    }
}

async fn run_graph(
    file: PathBuf,
    input: Option<String>,
    config: Option<PathBuf>,
    store: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());
    let graph = load_graph(&file)?;

    println!("📋 Graph: {} (v{})", graph.name, graph.version);
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    println!();

    let input: serde_json::Value = match input {
        Some(input_str) => serde_json::from_str(&input_str).context("input must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let config = match config {
        Some(path) => RuntimeConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    let mut registry = relayengine::CapabilityRegistry::new();
    relaysteps::register_all(&mut registry, chat_model());
    let registry = Arc::new(registry);

    let engine = match store {
        Some(dir) => {
            let store = JsonFileRunStore::open(&dir).await?;
            WorkflowEngine::with_store(registry, Arc::new(store), config)
        }
        None => WorkflowEngine::with_config(registry, config),
    };

    let graph_id = graph.id;
    engine.register_graph(graph).await?;
    let run_id = engine.create_run(graph_id, input).await?;

    // Subscribe before executing so no event is missed
    let mut events = engine.subscribe(run_id);
    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                notice = events.recv_notice() => match notice {
                    Some(notice) => print_notice(notice),
                    None => break,
                },
                // The run is over; print what is still buffered and stop
                _ = &mut done_rx => {
                    while let Some(notice) = events.try_recv_notice() {
                        print_notice(notice);
                    }
                    break;
                }
            }
        }
    });

    let executed = engine.execute(run_id).await;
    let _ = done_tx.send(());
    event_task.await?;
    executed?;

    let run = engine.get_run(run_id).await?;
    let nodes = engine.list_node_states(run_id).await?;

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", run.run_id);
    println!("   Status: {}", run.status);
    if let Some(message) = &run.last_message {
        println!("   Message: {}", message);
    }
    println!();
    println!("   {:<20} {:<10} {:>8}", "NODE", "STATUS", "ATTEMPTS");
    for node in &nodes {
        println!(
            "   {:<20} {:<10} {:>8}",
            node.node_id.as_str(),
            node.status.to_string(),
            node.attempts
        );
    }

    if let Some(output) = &run.output {
        println!();
        println!("📤 Output:");
        println!("{}", serde_json::to_string_pretty(output)?);
    }

    Ok(())
}

fn validate_graph(file: PathBuf) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());
    let graph = load_graph(&file)?;

    let engine = WorkflowEngine::new(Arc::new(relaysteps::default_registry()));
    let plan = engine.validate(&graph)?;

    println!("✅ Graph is valid:");
    println!("   Name: {}", graph.name);
    println!("   Entry: {}", plan.entry);
    for node_id in plan.topo_order() {
        let targets: Vec<String> = plan
            .successors(node_id)
            .iter()
            .map(|s| {
                let target = s
                    .target
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| relaycore::END_NODE.to_string());
                match &s.guard {
                    EdgeGuard::Always => target,
                    EdgeGuard::Branch(label) => format!("{} [{}]", target, label),
                    EdgeGuard::OnError => format!("{} [on error]", target),
                }
            })
            .collect();
        println!("   {} -> {}", node_id, targets.join(", "));
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Capabilities:");
    println!();

    let registry = relaysteps::default_registry();
    for info in registry.list() {
        let name = match &info.handler {
            Some(handler) => format!("{} / {}", info.kind, handler),
            None => format!("{} (default)", info.kind),
        };
        println!("  • {} ({})", name, info.metadata.category);
        println!("    {}", info.metadata.description);
    }
}

async fn list_runs(store: PathBuf) -> Result<()> {
    let store = JsonFileRunStore::open(&store).await?;
    let runs = store.list_runs().await?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10} {}  {}",
            run.run_id,
            run.status.to_string(),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.last_message.unwrap_or_default()
        );
    }
    Ok(())
}

fn create_example_graph(output: PathBuf) -> Result<()> {
    let mut graph = Graph::new("Example Branching Graph");
    graph.description = Some("Grades a topic and generates text when asked to continue".to_string());

    let start = graph.add_node(
        NodeSpec::new("start", NodeKind::Custom)
            .with_name("Start")
            .with_config("output", serde_json::json!({ "ready": true })),
    );
    let grade = graph.add_node(
        NodeSpec::new("grade", NodeKind::Llm)
            .with_name("Grade")
            .with_config("prompt", "Should we continue or end? Topic: {{input.topic}}")
            .with_config("select_branch", serde_json::json!(["continue", "end"]))
            .with_branches(["continue", "end"])
            .with_retry(3, 500),
    );
    let generate = graph.add_node(
        NodeSpec::new("generate", NodeKind::Llm)
            .with_name("Generate")
            .with_config("prompt", "Write a paragraph about {{input.topic}}"),
    );

    graph.connect(start, grade.clone());
    graph.connect_when(grade.clone(), "continue", generate);
    graph.connect_when(grade, "end", relaycore::END_NODE);

    let json = serde_json::to_string_pretty(&graph)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  relay run --file {} --input '{{\"topic\": \"rust\"}}'",
        output.display()
    );

    Ok(())
}
