//! TSocks: VPN control plane front end
//!
//! Loads a settings file, resolves it the same way the service does at
//! start, and prints what would be applied to the platform. Nothing on the
//! system is touched.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use tsocks_vpn::{establish, DryRunBuilder, InterfacePlan, ProxyProtocol, Settings};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Package identifier used when none is given
const DEFAULT_PACKAGE: &str = "com.tsocks.vpn";

#[derive(Parser, Debug)]
#[command(name = "tsocks", version, about = "TSocks VPN control plane")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a settings file and print the interface plan as JSON
    Plan {
        /// Settings file (.toml or .json)
        settings: PathBuf,
        /// Package identifier of the host application
        #[arg(long, default_value = DEFAULT_PACKAGE)]
        package: String,
    },
    /// Validate a settings file
    Check {
        /// Settings file (.toml or .json)
        settings: PathBuf,
    },
    /// Print the default settings
    Defaults {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Toml,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Plan { settings, package } => plan(&settings, &package),
        Command::Check { settings } => check(&settings),
        Command::Defaults { format } => defaults(format),
    }
}

fn load(path: &Path) -> Result<Settings> {
    Settings::from_file(path).with_context(|| format!("load settings from {}", path.display()))
}

fn plan(path: &Path, package: &str) -> Result<()> {
    let settings = load(path)?;
    let plan = InterfacePlan::resolve(&settings, package).context("resolve settings")?;

    let mut builder = DryRunBuilder::new();
    let calls = builder.call_log();
    let established = establish(&plan, &mut builder).context("build interface")?;
    let launch = plan.launch(established.handle.fd());
    let interface = calls.snapshot();
    established.handle.close();

    let out = json!({
        "plan": plan.summary(),
        "interface": interface,
        "app_errors": established.app_errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        "engine": {
            "protocol": launch.protocol,
            "server": launch.server,
            "port": launch.port,
            "excluded_routes": launch.excluded_routes,
            "mtu": launch.mtu,
            "log_level": launch.log_level,
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let settings = load(path)?;
    let plan = InterfacePlan::resolve(&settings, DEFAULT_PACKAGE).context("invalid settings")?;

    info!(
        "{}: {} via {}, {} routes, {} route warnings",
        path.display(),
        plan.tunnel.session_name,
        plan.endpoint,
        plan.routes.len(),
        plan.listed.warnings.len()
    );
    println!("ok");
    Ok(())
}

fn defaults(format: Format) -> Result<()> {
    let settings = Settings::default();

    match format {
        Format::Toml => {
            print!("{}", settings.to_toml()?);
            println!();
            println!("# Conventional proxy ports:");
            for protocol in ProxyProtocol::all() {
                if let Some(port) = protocol.default_port() {
                    println!("#   {:<12} {}", protocol.name(), port);
                }
            }
        }
        Format::Json => println!("{}", settings.to_json()?),
    }
    Ok(())
}
