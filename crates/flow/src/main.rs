//! Flow
//!
//! Command line runner for flow graphs: loads templates from a directory,
//! runs and validates them, and moves execution state in and out of save games.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flow_runtime::{
    AssetLoader, DirectoryAssetLoader, FlowEvent, FlowSettings, FlowSubsystem, NodeRegistry,
    RuntimeSeverity, validate_asset,
};
use flow_types::{FinishPolicy, FlowSaveData, ValidationSeverity};

/// Flow graph runner
#[derive(Parser, Debug)]
#[command(name = "flow")]
#[command(about = "Run and inspect flow graphs", long_about = None)]
struct Args {
    /// Directory holding flow templates (.json / .toml)
    #[arg(short, long, default_value = "./flows", global = true)]
    assets: PathBuf,

    /// Runtime settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a root flow and run it until it settles
    Run {
        /// Asset path of the template, relative to the asset directory
        asset: String,

        /// Owner the root flow is started for
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Custom inputs to fire after start, in order
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Finish the flow when done, keeping its state (`keep`) or not (`abort`)
        #[arg(long)]
        finish: Option<PolicyArg>,

        /// Write a save game to this file when done
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Restore flows from a save game and run them until they settle
    Load {
        /// Save game written by `run --save`
        save: PathBuf,

        /// Custom inputs to fire on every restored root, in order
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Write the resulting save game to this file
        #[arg(long)]
        save_to: Option<PathBuf>,
    },
    /// Check templates against the node registry
    Validate {
        /// Asset paths to check, every template in the directory if empty
        assets: Vec<String>,
    },
    /// List templates and registered node types
    List,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Keep,
    Abort,
}

impl From<PolicyArg> for FinishPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Keep => FinishPolicy::Keep,
            PolicyArg::Abort => FinishPolicy::Abort,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let settings = match &args.config {
        Some(path) => FlowSettings::load(path)
            .await
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => FlowSettings::default(),
    };
    let loader = Arc::new(DirectoryAssetLoader::new(&args.assets));
    let registry = Arc::new(NodeRegistry::with_builtins());

    match args.command {
        Command::Run {
            asset,
            owner,
            inputs,
            finish,
            save,
        } => {
            let mut flows = FlowSubsystem::new(Arc::new(settings), registry, loader);
            let mut events = flows.subscribe();

            flows.preload_asset(&asset).await?;
            let id = flows.start_root_flow(&owner, &asset)?;
            info!(instance = %id, "Root flow started");
            settle(&mut flows, &mut events).await;

            for input in &inputs {
                if flows.root_instance_id(&owner, &asset).is_none() {
                    warn!(input = %input, "Root flow already finished, input skipped");
                    continue;
                }
                flows.trigger_root_custom_input(&owner, &asset, input)?;
                settle(&mut flows, &mut events).await;
            }

            if let Some(policy) = finish {
                if flows.root_instance_id(&owner, &asset).is_some() {
                    flows.finish_root_flow(&owner, &asset, policy.into())?;
                    settle(&mut flows, &mut events).await;
                }
            }

            if let Some(path) = save {
                write_save(&path, &flows.save_game()).await?;
            }
            report(&flows)
        }
        Command::Load {
            save,
            inputs,
            save_to,
        } => {
            let content = tokio::fs::read_to_string(&save)
                .await
                .with_context(|| format!("Failed to read {}", save.display()))?;
            let data: FlowSaveData = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse save game {}", save.display()))?;
            let roots: Vec<(String, String)> = data
                .root_flows
                .iter()
                .map(|r| (r.owner.clone(), r.asset_path.clone()))
                .collect();

            let mut flows = FlowSubsystem::new(Arc::new(settings), registry, loader);
            let mut events = flows.subscribe();
            let restored = flows.load_game(data);
            info!(count = restored.len(), "Restored root flows");
            settle(&mut flows, &mut events).await;

            for input in &inputs {
                for (owner, asset) in &roots {
                    if flows.root_instance_id(owner, asset).is_some() {
                        flows.trigger_root_custom_input(owner, asset, input)?;
                        settle(&mut flows, &mut events).await;
                    }
                }
            }

            if let Some(path) = save_to {
                write_save(&path, &flows.save_game()).await?;
            }
            report(&flows)
        }
        Command::Validate { assets } => {
            let assets = if assets.is_empty() {
                loader.discover().await?
            } else {
                assets
            };
            validate(loader.as_ref(), &registry, &assets)
        }
        Command::List => {
            for asset in loader.discover().await? {
                println!("{}", asset);
            }
            for category in registry.categories() {
                println!("[{}]", category);
                for node_type in registry.nodes_in_category(&category) {
                    println!("  {}", node_type);
                }
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flow=info,flow_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resume queued sub-flow loads until none are left, logging events on the way
async fn settle(flows: &mut FlowSubsystem, events: &mut broadcast::Receiver<FlowEvent>) {
    loop {
        drain_events(events);
        if flows.pending_load_count() == 0 {
            break;
        }
        flows.process_pending_loads().await;
    }
}

fn drain_events(events: &mut broadcast::Receiver<FlowEvent>) {
    loop {
        match events.try_recv() {
            Ok(FlowEvent::FlowStarted { instance, asset }) => {
                info!(instance = %instance, asset = %asset, "Flow started")
            }
            Ok(FlowEvent::FlowFinished {
                instance,
                asset,
                policy,
            }) => info!(instance = %instance, asset = %asset, %policy, "Flow finished"),
            Ok(FlowEvent::CustomOutput {
                instance,
                event_name,
            }) => info!(instance = %instance, event = %event_name, "Custom output"),
            Ok(FlowEvent::NodeFinished { .. }) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event receiver lagged")
            }
            Err(_) => break,
        }
    }
}

fn report(flows: &FlowSubsystem) -> Result<()> {
    for id in flows.instance_ids() {
        if let Some(instance) = flows.instance(id) {
            info!(
                instance = %id,
                owner = %instance.owner(),
                active = instance.active_nodes().len(),
                "Flow still running"
            );
        }
    }
    let errors = flows
        .runtime_log()
        .iter()
        .filter(|m| m.severity == RuntimeSeverity::Error)
        .count();
    if errors > 0 {
        bail!("{} runtime error(s) while running flows", errors);
    }
    Ok(())
}

async fn write_save(path: &Path, data: &FlowSaveData) -> Result<()> {
    let content = serde_json::to_string_pretty(data)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), instances = data.instances.len(), "Wrote save game");
    Ok(())
}

fn validate(loader: &dyn AssetLoader, registry: &NodeRegistry, assets: &[String]) -> Result<()> {
    let mut failed = 0;
    for path in assets {
        let asset = match loader.load_sync(path) {
            Ok(asset) => asset,
            Err(e) => {
                error!(asset = %path, "{}", e);
                failed += 1;
                continue;
            }
        };
        let log = validate_asset(&asset, registry);
        for message in &log.messages {
            match message.severity {
                ValidationSeverity::Error => error!(asset = %path, "{}", message),
                ValidationSeverity::Warning => warn!(asset = %path, "{}", message),
            }
        }
        if log.has_errors() {
            failed += 1;
        } else {
            info!(asset = %path, "Valid");
        }
    }
    if failed > 0 {
        bail!("{} of {} template(s) failed validation", failed, assets.len());
    }
    Ok(())
}
