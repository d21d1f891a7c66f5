use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use toolhost::{
    config::ToolHostConfig,
    events::HostEvent,
    host::ToolHost,
    logger::init_tracing,
    schema::write_schema,
    tool::{Tool, discover_tools},
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "toolhost",
    about = "Runs tools in isolated, supervised worker processes",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write a daily log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Per-call timeout for tool requests, in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and activate every tool, then wait for Ctrl-C
    Run(ToolsDirArgs),

    /// Load one tool, run a single command and print its result
    Call(CallArgs),

    /// List the tools found in the tools directory
    List(ToolsDirArgs),

    /// Emit JSON-Schema for manifests, messages and config
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct ToolsDirArgs {
    #[arg(long)]
    tools_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Directory holding the tool's tool.json
    tool_dir: PathBuf,
    command: String,
    /// Positional arguments, each parsed as JSON (bare words become strings)
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ToolHostConfig::from_env();
    if let Some(level) = cli.global.log_level {
        config.log_level = level;
    }
    if let Some(dir) = cli.global.log_dir {
        config.log_dir = Some(dir);
    }
    if let Some(ms) = cli.global.request_timeout_ms {
        config.request_timeout_ms = ms;
    }
    let _log_guard = init_tracing(&config.log_level, config.log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(ToolsDirArgs { tools_dir: None })) {
        Commands::Run(args) => {
            if let Some(dir) = args.tools_dir {
                config.tools_dir = dir;
            }
            run(config).await
        }
        Commands::Call(args) => call(config, args).await,
        Commands::List(args) => {
            let dir = args.tools_dir.unwrap_or(config.tools_dir);
            for tool in discover_tools(&dir)? {
                println!("{}\t{}\t{}\t{}", tool.id, tool.version, tool.name, tool.entry.display());
            }
            Ok(())
        }
        Commands::Schema(args) => {
            let written = write_schema(&args.out)?;
            println!("Schemas written to {}: {}", args.out.display(), written.join(", "));
            Ok(())
        }
    }
}

async fn run(config: ToolHostConfig) -> anyhow::Result<()> {
    let tools = discover_tools(&config.tools_dir)?;
    if tools.is_empty() {
        warn!("No tools found in {}", config.tools_dir.display());
    }
    let host = ToolHost::with_local_services(config);

    // ── host event log ──────────────────────────────────────────────
    let mut events = host.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::Error { tool_id, error }) => error!(%tool_id, "{error}"),
                Ok(event) => info!(tool_id = %event.tool_id(), ?event, "host event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "host event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (tool_id, err) in host.load_tools(tools).await {
        error!(%tool_id, "failed to load: {err}");
    }
    for status in host.list_tools() {
        if let Err(err) = host.activate_tool(&status.id).await {
            error!(tool_id = %status.id, "failed to activate: {err}");
        }
    }
    info!(tools = host.list_tools().len(), "tool host running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    host.dispose().await;
    Ok(())
}

async fn call(config: ToolHostConfig, args: CallArgs) -> anyhow::Result<()> {
    let tool = Tool::from_dir(&args.tool_dir)?;
    let tool_id = tool.id.clone();
    let host = ToolHost::with_local_services(config);

    host.load_tool(tool).await?;
    let params: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let outcome = match host.activate_tool(&tool_id).await {
        Ok(()) => host.execute_command(&tool_id, &args.command, params).await,
        Err(err) => Err(err),
    };
    host.dispose().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(err) => bail!("{tool_id}: {err}"),
    }
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
