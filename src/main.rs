//! Simulator session broker CLI.
//!
//! Inspects backend capabilities, validates board files, shows the engine
//! invocation a board would produce, and runs a single interactive session
//! with its console attached to stdout.

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use virserver::adapters::{
    Engine, EngineAdapter, ProgramFormat, ProgramMetadata, Qemu, Renode, SkyEye, StartOptions,
};
use virserver::board::ResourceConfig;
use virserver::{
    build_adapters, expand_path, BackendAdapter, BackendType, BoardConfig, BrokerConfig, Caller,
    CreateSessionRequest, MemoryStore, OpContext, PortAllocator, PowerAction, SessionService,
};

/// Template used by `run` when neither a board file nor a template is given.
const DEFAULT_TEMPLATE: &str = "stm32f4-disco";

#[derive(Parser)]
#[command(name = "virserver", version, about = "Simulator session broker")]
struct Cli {
    #[command(flatten)]
    broker: BrokerArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the capability matrix of all backends
    Capabilities(CapabilitiesArgs),
    /// Parse and validate a board file
    Validate(ValidateArgs),
    /// Print the engine invocation a board would produce, without spawning it
    LaunchPlan(LaunchPlanArgs),
    /// Run one session and stream its console until interrupted
    Run(RunArgs),
}

#[derive(Args)]
struct BrokerArgs {
    /// Broker configuration file (JSON); the flags below override it
    #[arg(long, global = true, env = "VIRSERVER_CONFIG")]
    config: Option<String>,
    /// Root for the work, artifact and snapshot directories
    #[arg(long, global = true, env = "VIRSERVER_DATA_DIR")]
    data_dir: Option<String>,
    /// First port handed to engines
    #[arg(long, global = true, env = "VIRSERVER_PORT_RANGE_START")]
    port_range_start: Option<u16>,
    /// End of the engine port range (exclusive)
    #[arg(long, global = true, env = "VIRSERVER_PORT_RANGE_END")]
    port_range_end: Option<u16>,
    /// Host name reported in GDB server addresses
    #[arg(long, global = true, env = "VIRSERVER_ADVERTISE_HOST")]
    advertise_host: Option<String>,
    /// Maximum live instances per backend
    #[arg(long, global = true, env = "VIRSERVER_MAX_INSTANCES")]
    max_instances: Option<usize>,
    /// Command wrapping every engine invocation (comma-separated)
    #[arg(long, global = true, env = "VIRSERVER_LAUNCHER", value_delimiter = ',')]
    launcher: Vec<String>,
}

impl BrokerArgs {
    fn load(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(expand_path(path))?;
                serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("invalid config {path}: {e}"))?
            }
            None => BrokerConfig::default(),
        };
        if let Some(root) = &self.data_dir {
            let rooted = BrokerConfig::rooted_at(&expand_path(root));
            config.work_dir = rooted.work_dir;
            config.artifact_dir = rooted.artifact_dir;
            config.snapshot_dir = rooted.snapshot_dir;
        }
        if let Some(start) = self.port_range_start {
            config.port_range_start = start;
        }
        if let Some(end) = self.port_range_end {
            config.port_range_end = end;
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = host.clone();
        }
        if let Some(max) = self.max_instances {
            config.max_instances_per_backend = max;
        }
        if !self.launcher.is_empty() {
            config.binaries.launcher_prefix = self.launcher.clone();
        }
        if config.port_range_start >= config.port_range_end {
            anyhow::bail!(
                "empty port range {}..{}",
                config.port_range_start,
                config.port_range_end
            );
        }
        Ok(config)
    }
}

#[derive(Args)]
struct CapabilitiesArgs {
    /// Only show this backend's full capability report
    #[arg(long)]
    backend: Option<BackendType>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Path to the board JSON file
    #[arg(long)]
    board: String,
}

#[derive(Args)]
struct LaunchPlanArgs {
    /// Path to the board JSON file
    #[arg(long)]
    board: String,
    /// Backend whose invocation to show
    #[arg(long, default_value = "qemu")]
    backend: BackendType,
}

#[derive(Args)]
struct RunArgs {
    /// Session name
    #[arg(long, default_value = "cli")]
    name: String,
    /// Path to a board JSON file
    #[arg(long, conflicts_with = "template")]
    board: Option<String>,
    /// Stored board template to use instead of a file
    #[arg(long)]
    template: Option<String>,
    /// Backend to run on (defaults to the configured default backend)
    #[arg(long)]
    backend: Option<BackendType>,
    /// Program image to upload and start (.elf or .bin)
    #[arg(long)]
    program: Option<String>,
    /// Load address for raw binaries (hex 0x... or decimal)
    #[arg(long, value_parser = parse_address)]
    load_addr: Option<u64>,
    /// Halt at the entry point until a debugger continues
    #[arg(long)]
    wait_for_gdb: bool,
    /// Record an execution trace
    #[arg(long)]
    trace: bool,
}

fn main() -> anyhow::Result<()> {
    // stdout carries command output and the session console
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("virserver=info")))
        .init();

    let cli = Cli::parse();
    let config = cli.broker.load()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        match cli.command {
            Command::Capabilities(args) => show_capabilities(&config, args).await,
            Command::Validate(args) => validate_board(args),
            Command::LaunchPlan(args) => show_launch_plan(&config, args).await,
            Command::Run(args) => run_session(config, args).await,
        }
    })
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s}: {e}"))
}

fn load_board(path: &str) -> anyhow::Result<BoardConfig> {
    let text = std::fs::read_to_string(expand_path(path))?;
    let board = BoardConfig::from_json(&text)?;
    board.validate()?;
    Ok(board)
}

async fn build_service(config: &BrokerConfig) -> SessionService {
    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    let service = SessionService::new(Arc::new(MemoryStore::seeded()), config.default_backend);
    for adapter in build_adapters(config, ports) {
        service.register_adapter(adapter).await;
    }
    service
}

async fn show_capabilities(config: &BrokerConfig, args: CapabilitiesArgs) -> anyhow::Result<()> {
    let output = match args.backend {
        Some(backend) => {
            let ports = Arc::new(PortAllocator::default());
            let adapter = build_adapters(config, ports)
                .into_iter()
                .find(|a| a.backend_type() == backend)
                .ok_or_else(|| anyhow::anyhow!("backend {backend} is not available"))?;
            serde_json::to_string_pretty(&adapter.capabilities())?
        }
        None => serde_json::to_string_pretty(&build_service(config).await.capabilities().await)?,
    };
    println!("{output}");
    Ok(())
}

fn validate_board(args: ValidateArgs) -> anyhow::Result<()> {
    let board = load_board(&args.board)?;
    println!("{}: {} ({} nodes)", board.system_id, board.name, board.nodes.len());
    for node in &board.nodes {
        println!(
            "  {} [{}] {} x{} {} MiB, {} peripherals",
            node.id,
            node.backend,
            node.processor.kind,
            node.processor.cores,
            node.total_memory_mib(),
            node.peripherals.len()
        );
    }
    Ok(())
}

async fn show_launch_plan(config: &BrokerConfig, args: LaunchPlanArgs) -> anyhow::Result<()> {
    let board = load_board(&args.board)?;
    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    match args.backend {
        BackendType::Qemu => print_launch_plan(EngineAdapter::new(Qemu, config, ports), &board).await,
        BackendType::Renode => {
            print_launch_plan(EngineAdapter::new(Renode, config, ports), &board).await
        }
        BackendType::SkyEye => {
            print_launch_plan(EngineAdapter::new(SkyEye, config, ports), &board).await
        }
    }
}

async fn print_launch_plan<E: Engine>(
    adapter: EngineAdapter<E>,
    board: &BoardConfig,
) -> anyhow::Result<()> {
    let ctx = OpContext::background();
    let resources = board.resources.unwrap_or_default();
    let instance_id = adapter
        .create_instance(&ctx, "plan", board, &resources)
        .await?;
    let plan = adapter.launch_plan(&instance_id).await;
    adapter.destroy_instance(&ctx, &instance_id).await?;
    println!("{}", serde_json::to_string_pretty(&plan?)?);
    Ok(())
}

fn program_metadata(path: &Path, load_addr: Option<u64>) -> ProgramMetadata {
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("bin") => ProgramFormat::Bin,
        Some(ext) if ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex") => {
            ProgramFormat::Hex
        }
        _ => ProgramFormat::Elf,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string());
    ProgramMetadata {
        name,
        format,
        entry_point: None,
        load_addr,
        metadata: Default::default(),
    }
}

async fn run_session(config: BrokerConfig, args: RunArgs) -> anyhow::Result<()> {
    config.prepare_dirs();
    let service = build_service(&config).await;
    let marked = service.reconcile().await?;
    if marked > 0 {
        warn!(sessions = marked, "Stale sessions marked as error");
    }

    let ctx = OpContext::background();
    let caller = Caller::anonymous();
    let board_config = match &args.board {
        Some(path) => Some(std::fs::read_to_string(expand_path(path))?),
        None => None,
    };
    let board_template = match (&board_config, &args.template) {
        (Some(_), _) => None,
        (None, Some(template)) => Some(template.clone()),
        (None, None) => Some(DEFAULT_TEMPLATE.to_string()),
    };
    let request = CreateSessionRequest {
        name: args.name.clone(),
        backend: args.backend,
        board_config,
        board_template,
        resources: ResourceConfig::default(),
    };

    let session = service.create_session(&ctx, &caller, request).await?;
    info!(session_id = %session.id, instance_id = %session.instance_id, "Session ready");

    let result = drive_session(&service, &ctx, &caller, &session.id, &args).await;
    if let Err(err) = &result {
        error!(session_id = %session.id, "Session failed: {err}");
    }

    if let Err(e) = service.delete_session(&ctx, &caller, &session.id).await {
        warn!(session_id = %session.id, error = %e, "Failed to delete session");
    }
    service.shutdown_all(&ctx).await;
    result
}

async fn drive_session(
    service: &SessionService,
    ctx: &OpContext,
    caller: &Caller,
    session_id: &str,
    args: &RunArgs,
) -> anyhow::Result<()> {
    let (adapter, instance_id) = service.get_adapter(caller, session_id).await?;
    let mut console = adapter.console_stream(&instance_id).await?;

    service
        .power_control(ctx, caller, session_id, PowerAction::On)
        .await?;

    if let Some(path) = &args.program {
        let path = expand_path(path);
        let image = Bytes::from(std::fs::read(&path)?);
        let metadata = program_metadata(&path, args.load_addr);
        let uploaded = adapter
            .upload_program(ctx, &instance_id, image, metadata)
            .await;
        service.observe(session_id, &uploaded).await;
        let program_id = uploaded?;

        let options = StartOptions {
            wait_for_gdb: args.wait_for_gdb,
            enable_trace: args.trace,
            ..StartOptions::default()
        };
        let started = adapter
            .start_program(ctx, &instance_id, &program_id, &options)
            .await;
        service.observe(session_id, &started).await;
        started?;
    }

    match adapter.gdb_server_address(&instance_id).await {
        Ok(address) => info!(address = %address, "GDB server available"),
        Err(e) => info!("No GDB server: {e}"),
    }

    let mut stdout = tokio::io::stdout();
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("Shutdown signal received");
                break;
            }
            chunk = console.recv() => match chunk {
                Some(chunk) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                None => {
                    info!("Console closed");
                    break;
                }
            }
        }
    }

    if args.trace {
        match adapter.export_trace(ctx, &instance_id).await {
            Ok(artifact) => info!(path = %artifact.path.display(), "Trace exported"),
            Err(e) => warn!("Trace export failed: {e}"),
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
