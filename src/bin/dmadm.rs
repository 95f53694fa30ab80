//! Device mapper administration tool
//!
//! Talks to a running mapper over its control socket, or runs one.
//!
//! # Examples
//!
//! ```bash
//! # Run the mapper daemon
//! dmadm serve --config /etc/devmapper.toml
//!
//! # Bind a mapping and list the table
//! dmadm create data1 /dev/dsk/c0t0d0s0
//! dmadm list
//!
//! # Route a mapping through a module
//! dmadm load debug
//! dmadm create traced debug:/dev/dsk/c0t1d0s0
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use devmapper::control::{ControlClient, ModuleRecord};
use devmapper::{DeviceMapper, MapperConfig, MappingEntry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Device mapper administration
#[derive(Parser, Debug)]
#[command(name = "dmadm")]
#[command(version = devmapper::VERSION)]
#[command(about = "Device mapper administration", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "DEVMAPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket, overriding the configured one
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log directory path (used by `serve`)
    #[arg(long, global = true, default_value = "logs", env = "DEVMAPPER_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// List all mappings
    List(ListArgs),

    /// Show one mapping
    Show {
        /// Mapping name
        name: String,
    },

    /// Create a mapping
    Create {
        /// Mapping name
        name: String,
        /// Backing device path, optionally prefixed with `<module>:`
        device: String,
    },

    /// Remove a mapping
    Remove {
        /// Mapping name
        name: String,
    },

    /// Run the mapper and serve the control socket
    Serve(ServeArgs),

    /// List loaded modules
    Plugins(ListArgs),

    /// Load a module
    Load {
        /// Module name
        name: String,
    },

    /// Unload a module
    Unload {
        /// Module name
        name: String,
    },

    /// Print the effective configuration
    Config,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Version => "version",
            Commands::List(_) => "list",
            Commands::Show { .. } => "show",
            Commands::Create { .. } => "create",
            Commands::Remove { .. } => "remove",
            Commands::Serve(_) => "serve",
            Commands::Plugins(_) => "plugins",
            Commands::Load { .. } => "load",
            Commands::Unload { .. } => "unload",
            Commands::Config => "config",
        }
    }
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Expose Prometheus metrics on this address
    #[arg(long, env = "DEVMAPPER_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("failed to set up logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let name = cli.command.name();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} command failed: {:#}", name, e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = MapperConfig::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.control_socket = socket;
    }

    match cli.command {
        Commands::Version => {
            println!("Device mapper");
            println!("\tPackage version\t\t{}", devmapper::VERSION);
            println!("\tControl ABI version\t{}", devmapper::ABI_VERSION);
            Ok(())
        }
        Commands::List(args) => list_command(&config, args).await,
        Commands::Show { name } => show_command(&config, &name).await,
        Commands::Create { name, device } => {
            let mut client = connect(&config).await?;
            client.attach(&name, &device).await?;
            info!(name = %name, device = %device, "Mapping created");
            Ok(())
        }
        Commands::Remove { name } => {
            let mut client = connect(&config).await?;
            client.detach(&name).await?;
            info!(name = %name, "Mapping removed");
            Ok(())
        }
        Commands::Serve(args) => serve_command(config, args).await,
        Commands::Plugins(args) => plugins_command(&config, args).await,
        Commands::Load { name } => {
            let mut client = connect(&config).await?;
            client.load_plugin(&name).await?;
            Ok(())
        }
        Commands::Unload { name } => {
            let mut client = connect(&config).await?;
            client.unload_plugin(&name).await?;
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn connect(config: &MapperConfig) -> anyhow::Result<ControlClient> {
    ControlClient::connect(&config.control_socket)
        .await
        .with_context(|| {
            format!(
                "cannot reach control socket {}",
                config.control_socket.display()
            )
        })
}

async fn list_command(config: &MapperConfig, args: ListArgs) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    let entries: Vec<MappingEntry> = client
        .list_mappings()
        .await?
        .into_iter()
        .filter(|e| !e.is_empty())
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!("{} - {}\t({})", entry.slot.get(), entry.name, entry.backing_path);
    }
    Ok(())
}

async fn show_command(config: &MapperConfig, name: &str) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    let entry = client
        .list_mappings()
        .await?
        .into_iter()
        .find(|e| !e.is_empty() && e.name == name)
        .with_context(|| format!("no mapping named '{}'", name))?;

    println!("Name:    {}", entry.name);
    println!("Slot:    {}", entry.slot.get());
    println!("Device:  {}", entry.backing_path);
    println!("Target:  {}", serde_json::to_value(entry.target)?.as_str().unwrap_or("unknown"));
    Ok(())
}

async fn plugins_command(config: &MapperConfig, args: ListArgs) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    let modules: Vec<ModuleRecord> = client.list_plugins().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
        return Ok(());
    }

    if modules.is_empty() {
        println!("No modules loaded.");
        return Ok(());
    }
    for module in &modules {
        println!(
            "{}\trefs {}\trevision {}",
            module.name, module.refcount, module.revision
        );
    }
    Ok(())
}

async fn serve_command(config: MapperConfig, args: ServeArgs) -> anyhow::Result<()> {
    info!(version = %devmapper::VERSION, "Device mapper starting");

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let mapper = DeviceMapper::from_config(config)?;
    let server = mapper.control_server()?;
    let listener = server.bind()?;

    let result = server
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await;

    mapper.shutdown();
    result?;
    Ok(())
}

fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    // Only the daemon keeps a log file
    let file_layer = if matches!(cli.command, Commands::Serve(_)) {
        std::fs::create_dir_all(&cli.log_dir)?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "dmadm.log");
        Some(fmt::layer().with_writer(file_appender).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}
