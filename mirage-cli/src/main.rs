//! Mirage CLI
//!
//! Runs the node agent daemon and talks to a running one over its control
//! socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mirage_engine::{
    parse_parent_death_fd, Config, ControlClient, Coordinator, DaemonOptions, ExitStatus, Notify,
    OsPrimitives, PARENT_DEATH_FD_ENV,
};

/// Mirage - mesh VPN node agent
#[derive(Parser)]
#[command(name = "mirage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket path (overrides the configuration file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent daemon
    Run(RunArgs),

    /// Show the daemon's state
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect (or start an interactive login)
    Up,

    /// Disconnect
    Down,

    /// Select an exit node by id; an empty id clears it
    ExitNode {
        /// Stable node id
        #[arg(default_value = "")]
        id: String,
    },

    /// Log out of the control plane
    Logout,

    /// Stream notifications as JSON lines
    Watch,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "mirage.toml")]
        output: PathBuf,
    },

    /// Remove routes and DNS settings left behind by a crashed daemon
    Cleanup,
}

#[derive(Args)]
struct RunArgs {
    /// Comma-separated tunnel candidates, e.g. "mirage0,userspace-networking"
    #[arg(long)]
    tun: Option<String>,

    /// UDP listen port
    #[arg(long)]
    port: Option<u16>,

    /// State location: a file path, or "mem:"
    #[arg(long)]
    state: Option<String>,

    /// Directory for the state file when --state is not given
    #[arg(long)]
    statedir: Option<PathBuf>,

    /// Network namespace to configure routes in
    #[arg(long)]
    netns: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if let Commands::GenConfig { output } = &cli.command {
        return generate_config(output);
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.daemon.socket = socket;
    }

    match cli.command {
        Commands::Run(args) => run_daemon(config, args).await,
        Commands::Status { json } => show_status(&config, json).await,
        Commands::Up => {
            let status = client(&config).up().await.context("up failed")?;
            print_status(&status);
            Ok(())
        }
        Commands::Down => {
            let status = client(&config).down().await.context("down failed")?;
            print_status(&status);
            Ok(())
        }
        Commands::ExitNode { id } => {
            let status = client(&config)
                .set_exit_node(&id)
                .await
                .context("failed to set exit node")?;
            print_status(&status);
            Ok(())
        }
        Commands::Logout => {
            client(&config).logout().await.context("logout failed")?;
            println!("Logged out");
            Ok(())
        }
        Commands::Watch => watch(&config).await,
        Commands::Cleanup => cleanup(&config),
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => Ok(Config::default()),
    }
}

fn client(config: &Config) -> ControlClient {
    ControlClient::new(&config.daemon.socket)
}

async fn run_daemon(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(tun) = args.tun {
        config.daemon.tun = tun;
    }
    if let Some(port) = args.port {
        config.daemon.port = port;
    }
    if let Some(state) = args.state {
        config.daemon.state = Some(state);
    }
    if let Some(statedir) = args.statedir {
        config.daemon.statedir = statedir;
    }
    if args.netns.is_some() {
        config.daemon.netns = args.netns;
    }

    let mut options = DaemonOptions::from_config(&config).context("Invalid configuration")?;
    options.parent_death_fd =
        parse_parent_death_fd(std::env::var(PARENT_DEATH_FD_ENV).ok().as_deref())?;

    info!("Starting mirage node agent...");
    info!(
        "Control socket {:?}, state {}",
        options.socket, options.state
    );

    let primitives = OsPrimitives::new(config.daemon.mtu).with_netns(config.daemon.netns.clone());
    let coordinator = Coordinator::new(options, Arc::new(primitives));

    coordinator.run().await.context("Daemon failed")?;
    Ok(())
}

async fn show_status(config: &Config, json: bool) -> Result<()> {
    let status = client(config).status().await.context("Failed to get status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &Notify) {
    if let Some(state) = status.state {
        println!("State:     {}", state);
    }
    if let Some(ref url) = status.browse_to_url {
        println!("Log in at: {}", url);
    }
    if let Some(ref prefs) = status.prefs {
        if !prefs.hostname.is_empty() {
            println!("Hostname:  {}", prefs.hostname);
        }
        println!("Control:   {}", prefs.control_url);
        println!(
            "Options:   route_all={} corp_dns={} shields_up={}",
            prefs.route_all, prefs.corp_dns, prefs.shields_up
        );
    }
    if let Some(ref exits) = status.exit_nodes {
        match (exits.status, &exits.exit) {
            (ExitStatus::None, _) | (_, None) => println!("Exit node: none"),
            (status, Some(exit)) => println!("Exit node: {} ({}) {:?}", exit.label, exit.id, status),
        }
        for exit in &exits.exits {
            let marker = if exit.online { "*" } else { " " };
            println!("  {} {:<24} {}", marker, exit.label, exit.id);
        }
    }
    if let Some(ref netmap) = status.netmap {
        println!("Peers:     {}", netmap.peers.len());
        for peer in &netmap.peers {
            let ips: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            println!("  {:<24} {}", peer.name, ips.join(", "));
        }
    }
}

async fn watch(config: &Config) -> Result<()> {
    let mut conn = client(config)
        .watch()
        .await
        .context("Failed to open control session")?;

    loop {
        tokio::select! {
            msg = conn.recv() => match msg? {
                Some(notify) => println!("{}", serde_json::to_string(&notify)?),
                None => bail!("daemon closed the session"),
            },
            _ = signal::ctrl_c() => return Ok(()),
        }
    }
}

fn cleanup(config: &Config) -> Result<()> {
    let specs = config.daemon.tun_specs()?;

    #[cfg(target_os = "linux")]
    for spec in &specs {
        if let mirage_tun::TunSpec::Kernel(ref name) = spec {
            mirage_tun::linux::OsRouter::cleanup(name)
                .with_context(|| format!("Failed to clean up {}", name))?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = specs;

    mirage_tun::ResolvConf::cleanup(mirage_tun::dns::RESOLV_CONF)
        .context("Failed to restore resolv.conf")?;

    println!("Cleanup complete");
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);

    Ok(())
}
