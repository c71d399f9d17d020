//! hires CLI entrypoint.
//!
//! ```bash
//! hires upscale photo.jpg scans/ --scale 2 --model RealESRGAN_x4plus_anime_6B
//! hires upscale photo.jpg --package --json
//! hires results --session 6f1c0c8e-2a4b-4a8e-9d0e-3c1f4b5a6d7e
//! hires package --session 6f1c0c8e-2a4b-4a8e-9d0e-3c1f4b5a6d7e
//! hires purge --session 6f1c0c8e-2a4b-4a8e-9d0e-3c1f4b5a6d7e --json
//! hires devices --json
//! hires models
//! ```

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use hires_core::device::{DeviceProbe, SystemProbe, select_device};
use hires_core::error::{HiresError, Result};
use hires_core::types::{DeviceKind, SessionId};
use hires_ort::OnnxEngineFactory;
use hires_pipeline::session::content_type;
use hires_pipeline::{ServiceConfig, UploadedFile, UpscaleService};

#[derive(Parser, Debug)]
#[command(
    name = "hires",
    version,
    about = "Batch image super-resolution",
    arg_required_else_help = true,
    after_help = "Examples:\n  hires upscale photo.jpg --scale 2\n  hires upscale scans/ --model RealESRGAN_x4plus_anime_6B --package --json\n  hires results --session <id>\n  hires purge --session <id>\n  hires devices --json"
)]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a batch of images into a new session.
    Upscale(UpscaleArgs),
    /// Zip every result of a session.
    Package(SessionArgs),
    /// Delete a session's results and archive.
    Purge(SessionArgs),
    /// List the result files of a session.
    Results(SessionArgs),
    /// Report accelerator availability and the selected device.
    Devices(JsonArgs),
    /// List supported models and where their weights resolve.
    Models(JsonArgs),
}

#[derive(Args, Debug, Clone)]
struct ServiceArgs {
    /// JSON service configuration file.
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Root directory for uploads, results and archives.
    #[arg(long = "root", global = true)]
    root: Option<PathBuf>,

    /// Directory holding `<model>.onnx` weight files.
    #[arg(long = "weights-dir", global = true)]
    weights_dir: Option<PathBuf>,

    /// Base URL to fetch missing weights from.
    #[arg(long = "weights-url", global = true)]
    weights_url: Option<String>,

    /// Force a device: cuda, mps or cpu.
    #[arg(long = "device", global = true)]
    device: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct UpscaleArgs {
    /// Image files or directories (directories are read one level deep).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output scale factor: 2, 3 or 4.
    #[arg(short = 's', long = "scale")]
    scale: Option<u32>,

    /// Model name.
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Also write the session archive.
    #[arg(long = "package", default_value_t = false)]
    package: bool,

    /// Emit machine-readable JSON output.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Session identifier printed by `upscale`.
    #[arg(long = "session")]
    session: String,

    /// Emit machine-readable JSON output.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct JsonArgs {
    /// Emit machine-readable JSON output.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Upscale(args) if args.json => Some("upscale"),
        Commands::Package(args) if args.json => Some("package"),
        Commands::Purge(args) if args.json => Some("purge"),
        Commands::Results(args) if args.json => Some("results"),
        Commands::Devices(args) if args.json => Some("devices"),
        Commands::Models(args) if args.json => Some("models"),
        _ => None,
    };

    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(
                    error = %err,
                    code = err.error_code(),
                    session = err.session(),
                    "Command failed"
                );
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.service)?;
    match cli.command {
        Commands::Devices(args) => run_devices(&config, args),
        Commands::Models(args) => run_models(config, args),
        Commands::Results(args) => run_results(config, args),
        Commands::Purge(args) => run_purge(config, args),
        Commands::Package(args) => build_runtime()?.block_on(run_package(config, args)),
        Commands::Upscale(args) => build_runtime()?.block_on(run_upscale(config, args)),
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| HiresError::Config(format!("failed to build tokio runtime: {e}")))
}

/// File, then environment, then command-line flags.
fn load_config(args: &ServiceArgs) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(root) = &args.root {
        let defaults = ServiceConfig::with_root(root);
        config.upload_root = defaults.upload_root;
        config.result_root = defaults.result_root;
        config.archive_root = defaults.archive_root;
    }
    if let Some(dir) = &args.weights_dir {
        config.weights_dir = dir.clone();
    }
    if let Some(url) = &args.weights_url {
        config.weights_base_url = Some(url.clone());
    }
    if let Some(device) = &args.device {
        config.device = Some(device.parse::<DeviceKind>()?);
    }
    config.validate()?;
    Ok(config)
}

fn build_service(config: ServiceConfig) -> Result<UpscaleService> {
    UpscaleService::new(config, Arc::new(OnnxEngineFactory::new()))
}

// ─── Commands ───────────────────────────────────────────────────────────

async fn run_upscale(config: ServiceConfig, args: UpscaleArgs) -> Result<()> {
    let (variant, scale) = UpscaleService::parse_request(args.model.as_deref(), args.scale)?;
    let files = read_inputs(&args.inputs)?;
    let service = build_service(config)?;

    let started = Instant::now();
    let batch = service.upscale(files, scale, variant).await?;
    let archive = if args.package {
        Some(service.package(&batch.session_id).await?)
    } else {
        None
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let result_dir = service.store().result_dir_path(&batch.session_id);

    if args.json {
        let body = json!({
            "session_id": batch.session_id,
            "scale": batch.scale,
            "model": batch.model,
            "device": service.device(),
            "result_dir": result_dir,
            "elapsed_ms": elapsed_ms,
            "results": batch.results,
            "skipped": batch.skipped,
            "archive": archive,
        });
        println!("{}", success_json("upscale", body));
    } else {
        println!("session={}", batch.session_id);
        println!(
            "model={} scale={} device={} elapsed_ms={elapsed_ms}",
            batch.model,
            batch.scale.get(),
            service.device()
        );
        println!("result_dir={}", result_dir.display());
        for outcome in &batch.results {
            println!(
                "output={} source={} width={} height={}",
                outcome.output_name, outcome.original_name, outcome.width, outcome.height
            );
        }
        for skipped in &batch.skipped {
            println!("skipped={} reason={}", skipped.name, skipped.reason);
        }
        if let Some(archive) = &archive {
            println!("archive={} entries={}", archive.path.display(), archive.entries.len());
        }
    }
    Ok(())
}

async fn run_package(config: ServiceConfig, args: SessionArgs) -> Result<()> {
    let id = SessionId::parse(&args.session)?;
    let service = build_service(config)?;
    let archive = service.package(&id).await?;
    if args.json {
        let body = json!({ "session_id": id, "archive": archive });
        println!("{}", success_json("package", body));
    } else {
        println!("archive={}", archive.path.display());
        println!("entries={} bytes={}", archive.entries.len(), archive.bytes);
        println!("download_name={}", archive.download_name);
    }
    Ok(())
}

fn run_purge(config: ServiceConfig, args: SessionArgs) -> Result<()> {
    let id = SessionId::parse(&args.session)?;
    build_service(config)?.purge(&id)?;
    if args.json {
        println!("{}", success_json("purge", json!({ "session_id": id })));
    } else {
        println!("purged={id}");
    }
    Ok(())
}

fn run_results(config: ServiceConfig, args: SessionArgs) -> Result<()> {
    let id = SessionId::parse(&args.session)?;
    let service = build_service(config)?;
    let names = service.results(&id)?;
    let dir = service.store().result_dir_path(&id);
    if args.json {
        let files: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "path": dir.join(name),
                    "content_type": content_type(name),
                })
            })
            .collect();
        let body = json!({ "session_id": id, "result_dir": dir, "files": files });
        println!("{}", success_json("results", body));
    } else {
        println!("results: {}", names.len());
        for name in &names {
            println!("file={name} content_type={}", content_type(name));
        }
    }
    Ok(())
}

fn run_devices(config: &ServiceConfig, args: JsonArgs) -> Result<()> {
    let probe = SystemProbe;
    let cuda = probe.cuda_available();
    let mps = probe.mps_available();
    let selected = config.device.unwrap_or_else(select_device);
    let forced = config.device.is_some();
    if args.json {
        let body = json!({
            "cuda_available": cuda,
            "mps_available": mps,
            "selected": selected,
            "forced": forced,
        });
        println!("{}", success_json("devices", body));
    } else {
        println!("cuda_available={cuda}");
        println!("mps_available={mps}");
        println!("selected={selected} forced={forced}");
    }
    Ok(())
}

fn run_models(config: ServiceConfig, args: JsonArgs) -> Result<()> {
    let service = build_service(config)?;
    let catalog = service.model_catalog();
    if args.json {
        println!("{}", success_json("models", json!({ "models": catalog })));
    } else {
        println!("models: {}", catalog.len());
        for model in &catalog {
            println!(
                "model={} blocks={} native_scale={} weights={} present={}",
                model.name,
                model.blocks,
                model.native_scale,
                model.weights_path.display(),
                model.weights_present
            );
        }
    }
    Ok(())
}

// ─── Inputs ─────────────────────────────────────────────────────────────

/// Read every input into memory. Directory entries are sorted by name.
fn read_inputs(inputs: &[PathBuf]) -> Result<Vec<UploadedFile>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries = Vec::new();
            for entry in fs::read_dir(input).map_err(|e| HiresError::io(input, e))? {
                let path = entry.map_err(|e| HiresError::io(input, e))?.path();
                if path.is_file() {
                    entries.push(path);
                }
            }
            entries.sort();
            for path in entries {
                files.push(read_upload(&path)?);
            }
        } else {
            files.push(read_upload(input)?);
        }
    }
    Ok(files)
}

fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = fs::read(path).map_err(|e| HiresError::io(path, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(UploadedFile::new(name, bytes))
}

// ─── JSON ───────────────────────────────────────────────────────────────

fn success_json(command: &str, body: Value) -> Value {
    let mut out = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": true,
    });
    if let (Value::Object(out), Value::Object(body)) = (&mut out, body) {
        out.extend(body);
    }
    out
}

fn command_error_json(command: &str, err: &HiresError) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "status": err.status(),
        "kind": err.kind(),
        "session": err.session(),
        "error": err.to_string(),
    })
}
