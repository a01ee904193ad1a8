// shade — command-line front end for the Shade relay overlay
//
// `shade router` runs a router until Ctrl-C. `shade client <action>` runs
// one client operation (handshake, optional group join, the action, quit).
// `shade config` manages the JSON settings files.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use config::ConfigFile;
use shade_core::client::Delivery;
use shade_core::{ClientConfig, ClientSession, Router, RouterConfig};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shade")]
#[command(about = "Shade — layered-cipher relay overlay", long_about = None)]
#[command(version)]
struct Cli {
    /// Config directory (default: the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Also write JSON logs to daily-rotated files
    #[arg(long, global = true)]
    log_file: bool,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a router
    Router {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        listen: Option<String>,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run one client operation against a router
    Client {
        /// Router address (host:port)
        #[arg(short, long)]
        router: Option<String>,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Group passphrase
        #[arg(short, long)]
        group: Option<String>,
        #[command(subcommand)]
        action: ClientAction,
    },
    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Search the group's shared files
    Search { keyword: String },
    /// List the files one client shares
    Browse {
        client_id: String,
        #[arg(default_value = "")]
        path: String,
    },
    /// Send text to the whole group
    Chat { text: String },
    /// Send text to one client
    Message { client_id: String, text: String },
    /// Poll for deliveries
    Ping,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    Router,
    Client,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write default router and client config files
    Init {
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective settings
    Show {
        #[arg(value_enum)]
        scope: Option<Scope>,
    },
    Set {
        #[arg(value_enum)]
        scope: Scope,
        key: String,
        value: String,
    },
    Get {
        #[arg(value_enum)]
        scope: Scope,
        key: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Router { .. }, false) => "info",
        _ => "warn",
    };
    let _log_guard = init_logging(default_level, cli.log_file)?;

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => config::config_dir()?,
    };

    match cli.command {
        Commands::Router {
            port,
            listen,
            workers,
        } => {
            let mut config = RouterConfig::load_from_dir(&config_dir)?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(listen) = listen {
                config.listen_address = listen;
            }
            if let Some(workers) = workers {
                config.worker_threads = workers;
            }
            cmd_router(config)
        }
        Commands::Client {
            router,
            name,
            group,
            action,
        } => {
            let mut config = ClientConfig::load_from_dir(&config_dir)?;
            if let Some(router) = router {
                config.router_address = router;
            }
            if let Some(name) = name {
                config.name = name;
            }
            if group.is_some() {
                config.group_passphrase = group;
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .context("Failed to start runtime")?;
            runtime.block_on(cmd_client(config, action))
        }
        Commands::Config { action } => cmd_config(&config_dir, action),
    }
}

/// stderr logging filtered by RUST_LOG, plus optional daily log files.
/// Keep the returned guard alive so buffered file output is flushed.
fn init_logging(
    default_level: &str,
    log_file: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if log_file {
        let appender = tracing_appender::rolling::daily(config::log_dir()?, "shade.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // One JSON object per line, for log shippers
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    Ok(guard)
}

// ============================================================================
// ROUTER
// ============================================================================

fn cmd_router(config: RouterConfig) -> Result<()> {
    config.validate().context("Invalid router configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("shade-worker")
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    // The router is drained inside block_on, before the runtime drops
    runtime.block_on(async move {
        println!("{}", "Starting Shade router...".bold());
        let workers = config.worker_threads;
        let layers: Vec<String> = config
            .security
            .layers
            .iter()
            .map(|layer| layer.cipher.clone())
            .collect();

        let router = Router::start(config)
            .await
            .context("Failed to start router")?;

        println!("  {} Listening on {}", "✓".green(), router.local_addr().to_string().bright_cyan());
        println!("  {} Cipher layers: {}", "✓".green(), layers.join(" → ").bright_yellow());
        println!("  {} Worker threads: {}", "✓".green(), workers);
        println!();
        println!("Press {} to stop.", "Ctrl-C".bright_green());

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;

        println!();
        println!("{}", "Shutting down...".bold());
        let stats = router.stats();
        router.shutdown().await;

        println!("  Requests:   {} ({} rejected)", stats.requests, stats.rejected);
        println!(
            "  Sessions:   {} opened, {} evicted",
            stats.sessions_opened, stats.sessions_evicted
        );
        println!("  Traffic:    {} B in, {} B out", stats.bytes_read, stats.bytes_written);
        Ok::<(), anyhow::Error>(())
    })
}

// ============================================================================
// CLIENT
// ============================================================================

async fn cmd_client(config: ClientConfig, action: ClientAction) -> Result<()> {
    let session = ClientSession::connect(config)
        .await
        .context("Failed to connect to router")?;
    let session_id = session.handshake().await.context("Handshake failed")?;
    tracing::debug!("Session {}", session_id);

    if let Some(members) = session.join_configured().await.context("Join failed")? {
        println!("{} Joined group ({} members)", "✓".green(), members);
    }

    let result = run_action(&session, action).await;
    if let Err(e) = session.quit().await {
        tracing::warn!("Quit failed: {}", e);
    }
    result
}

async fn run_action(session: &ClientSession, action: ClientAction) -> Result<()> {
    match action {
        ClientAction::Search { keyword } => {
            let results = session.search(&keyword).await.context("Search failed")?;
            if results.is_empty() {
                println!("{}", "No matches.".dimmed());
                return Ok(());
            }
            println!("{} ({} matches)", "Search Results".bold(), results.len());
            println!();
            for result in results {
                println!(
                    "  {} {} {}",
                    "•".bright_green(),
                    result.file.path.bright_cyan(),
                    format!("({} B)", result.file.size).dimmed()
                );
                println!("    from {} [{}]", result.name, result.client_id.dimmed());
            }
        }
        ClientAction::Browse { client_id, path } => {
            let entries = session
                .browse(&client_id, &path)
                .await
                .context("Browse failed")?;
            if entries.is_empty() {
                println!("{}", "Nothing shared here.".dimmed());
                return Ok(());
            }
            for entry in entries {
                println!("  {} {}", entry.path.bright_cyan(), format!("({} B)", entry.size).dimmed());
            }
        }
        ClientAction::Chat { text } => {
            session.chat(&text).await.context("Chat failed")?;
            println!("{} Sent to group", "✓".green());
        }
        ClientAction::Message { client_id, text } => {
            session
                .message(&client_id, &text)
                .await
                .context("Message failed")?;
            println!("{} Sent to {}", "✓".green(), client_id.bright_cyan());
        }
        ClientAction::Ping => {
            let deliveries = session.ping().await.context("Ping failed")?;
            if deliveries.is_empty() {
                println!("{}", "No new deliveries.".dimmed());
            }
            for delivery in deliveries {
                print_delivery(&delivery);
            }
        }
    }
    Ok(())
}

fn print_delivery(delivery: &Delivery) {
    match delivery {
        Delivery::Chat {
            client_id,
            name,
            text,
        } => {
            println!("{} {} [{}]", "#".bright_blue(), name.bright_cyan(), client_id.dimmed());
            println!("   {}", text);
        }
        Delivery::Message { client_id, text } => {
            println!("{} {}", "←".bright_blue(), client_id.bright_cyan());
            println!("   {}", text);
        }
        Delivery::Tunnel {
            client_id,
            transfer_id,
            chunk_id,
            chunk,
        } => {
            println!(
                "{} chunk {}#{} ({} B) from {}",
                "⇐".bright_blue(),
                transfer_id,
                chunk_id,
                chunk.len(),
                client_id.bright_cyan()
            );
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

fn cmd_config(dir: &std::path::Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            init_file::<RouterConfig>(dir, force)?;
            init_file::<ClientConfig>(dir, force)?;
            println!();
            println!("{}", "Next steps:".bold());
            println!(
                "  • Set cipher passphrases: {}",
                "shade config set router layers aes:<secret>,serpent:<secret>".bright_green()
            );
            println!("  • Start a router:         {}", "shade router".bright_green());
        }
        ConfigAction::Show { scope } => match scope {
            Some(Scope::Router) => show::<RouterConfig>(dir)?,
            Some(Scope::Client) => show::<ClientConfig>(dir)?,
            None => {
                show::<RouterConfig>(dir)?;
                println!();
                show::<ClientConfig>(dir)?;
            }
        },
        ConfigAction::Set { scope, key, value } => {
            match scope {
                Scope::Router => set::<RouterConfig>(dir, &key, &value)?,
                Scope::Client => set::<ClientConfig>(dir, &key, &value)?,
            }
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { scope, key } => {
            let value = match scope {
                Scope::Router => RouterConfig::load_from_dir(dir)?.get(&key),
                Scope::Client => ClientConfig::load_from_dir(dir)?.get(&key),
            };
            match value {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
    }
    Ok(())
}

fn init_file<T: ConfigFile>(dir: &std::path::Path, force: bool) -> Result<()> {
    let path = T::path_in(dir);
    if path.exists() && !force {
        println!("  {} {} (exists)", "•".dimmed(), path.display());
        return Ok(());
    }
    let path = T::default().save_to_dir(dir)?;
    println!("  {} {}", "✓".green(), path.display());
    Ok(())
}

fn show<T: ConfigFile>(dir: &std::path::Path) -> Result<()> {
    let config = T::load_from_dir(dir)?;
    println!("{} ({})", T::FILE_NAME.bold(), T::path_in(dir).display());
    for (key, value) in config.list() {
        println!("  {:<22} {}", key.bright_cyan(), value);
    }
    Ok(())
}

fn set<T: ConfigFile>(dir: &std::path::Path, key: &str, value: &str) -> Result<()> {
    let mut config = T::load_from_dir(dir)?;
    config.set(key, value)?;
    config.save_to_dir(dir)?;
    Ok(())
}
