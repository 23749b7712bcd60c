//! sandcall CLI entry point.
//!
//! Runs one request against a guest module, or describes how a module will
//! be called.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sandcall_common::{ConfigFile, EntryPointShape, MountSpec};
use sandcall_runtime::{LoadOptions, ModuleHandle, RunOptions, Runtime};

#[derive(Parser)]
#[command(name = "sandcall")]
#[command(about = "Call sandboxed WebAssembly guest modules.", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "SANDCALL_LOG_JSON")]
    log_json: bool,

    /// TOML configuration file.
    #[arg(long, global = true, env = "SANDCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one request and print the guest's answer.
    Run(RunArgs),
    /// Load a module and print its calling convention.
    Inspect(ModuleArgs),
}

#[derive(clap::Args)]
struct ModuleArgs {
    /// Module to load (`.wasm`, or `.wat` text).
    #[arg(long, env = "SANDCALL_MODULE")]
    module: Option<PathBuf>,

    /// Exported entry point.
    #[arg(long)]
    entry: Option<String>,

    /// Entry point argument shape.
    #[arg(long, value_enum)]
    shape: Option<ShapeArg>,
}

#[derive(clap::Args)]
struct RunArgs {
    #[command(flatten)]
    module: ModuleArgs,

    /// Request text; `-` reads standard input.
    #[arg(long, default_value = "")]
    request: String,

    /// Directory to expose, as `host[:guest[:ro]]`. Repeatable.
    #[arg(long = "mount", value_name = "SPEC")]
    mounts: Vec<MountSpec>,

    /// Environment variable for the guest, as `KEY=VALUE`. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Abandon the call after this many milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Identifier passed to `with-identifier` entry points.
    #[arg(long, default_value_t = 0)]
    call_id: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShapeArg {
    Default,
    WithIdentifier,
}

impl From<ShapeArg> for EntryPointShape {
    fn from(shape: ShapeArg) -> Self {
        match shape {
            ShapeArg::Default => EntryPointShape::Default,
            ShapeArg::WithIdentifier => EntryPointShape::WithIdentifier,
        }
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sandcall=debug".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Module settings after merging the config file with command-line flags.
struct Target {
    path: PathBuf,
    options: LoadOptions,
}

fn resolve_target(file: &ConfigFile, args: &ModuleArgs) -> anyhow::Result<Target> {
    let path = args
        .module
        .clone()
        .or_else(|| file.module.path.as_ref().map(PathBuf::from))
        .context("No module given. Pass --module or set [module].path in the config file")?;

    let entry = args
        .entry
        .clone()
        .unwrap_or_else(|| file.module.entry_point.clone());
    let shape = args
        .shape
        .map_or(file.module.entry_shape, EntryPointShape::from);

    Ok(Target {
        path,
        options: LoadOptions::new(entry).with_shape(shape),
    })
}

async fn load(runtime: &Runtime, target: Target) -> anyhow::Result<ModuleHandle> {
    let Target { path, options } = target;
    let handle = if is_wat(&path) {
        let wat = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        runtime.load_wat(&wat, options).await?
    } else {
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        runtime.load(&bytes, options).await?
    };
    Ok(handle)
}

fn is_wat(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "wat")
}

async fn run(file: ConfigFile, args: RunArgs) -> anyhow::Result<()> {
    let target = resolve_target(&file, &args.module)?;

    let request = if args.request == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        args.request
    };

    let mut options = RunOptions {
        mounts: file.module.mounts,
        env: file.module.env.into_iter().collect(),
        call_id: args.call_id,
        ..Default::default()
    };
    options.mounts.extend(args.mounts);
    options.env.extend(args.env);
    if let Some(ms) = args.deadline_ms {
        options.deadline = Some(Duration::from_millis(ms));
    }

    let runtime = Runtime::open(&file.runtime)?;
    let handle = load(&runtime, target).await?;
    let result = handle.run(&request, options).await;
    handle.close()?;
    runtime.close()?;

    let output = result?;
    let report = serde_json::json!({
        "errno": output.errno,
        "response": output.response,
        "metrics": {
            "fuel_consumed": output.metrics.fuel_consumed,
            "log_count": output.metrics.log_count,
            "duration_ms": output.metrics.duration.map(|d| d.as_millis()),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

async fn inspect(file: ConfigFile, args: ModuleArgs) -> anyhow::Result<()> {
    let target = resolve_target(&file, &args)?;

    let runtime = Runtime::open(&file.runtime)?;
    let handle = load(&runtime, target).await?;

    let exports = handle.module().export_names();
    let entry_present = exports.iter().any(|name| name == handle.entry_point());
    let report = serde_json::json!({
        "content_hash": handle.module().content_hash(),
        "compile_ms": handle.module().compile_duration().as_millis(),
        "dialect": handle.dialect().to_string(),
        "system_interface": handle.system_interface().to_string(),
        "entry_point": handle.entry_point(),
        "entry_point_exported": entry_present,
        "exports": exports,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    handle.close()?;
    runtime.close()?;

    if !entry_present {
        bail!("entry point is not exported by the module");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };

    info!(config = ?cli.config, "Starting sandcall");

    match cli.command {
        Command::Run(args) => run(file, args).await,
        Command::Inspect(args) => inspect(file, args).await,
    }
}
