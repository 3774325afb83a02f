// NanoFiles host: directory server, directory client and peer file transfer.

mod config;
mod connector;
mod framing;
mod listener;
mod server;
mod session;
mod shared;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use nanofiles_core::FileCatalog;
use tokio::sync::watch;

use crate::config::Config;
use crate::connector::DirectoryConnector;
use crate::listener::PeerListener;
use crate::server::DirectoryServer;
use crate::session::PeerConnector;

#[derive(Parser)]
#[command(name = "nanofiles")]
#[command(about = "Directory-assisted peer-to-peer file sharing")]
#[command(version)]
struct Cli {
    /// Directory host (overrides config)
    #[arg(long, global = true)]
    directory: Option<String>,
    /// Shared folder (overrides config)
    #[arg(long, global = true)]
    shared_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the directory server
    Directory {
        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Probability of dropping each inbound datagram
        #[arg(long)]
        discard_probability: Option<f64>,
    },
    /// List nicknames registered at the directory
    Users,
    /// List files published at the directory
    Files,
    /// Register, publish the shared folder and serve it until interrupted
    Serve {
        /// Nickname to register
        #[arg(short, long)]
        nick: String,
        /// TCP port to serve on (0 picks one)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },
    /// List the files a peer serves
    Browse {
        /// Peer nickname or ip:port
        #[arg(short, long)]
        peer: String,
    },
    /// Download a file from a peer
    Download {
        /// Peer nickname or ip:port
        #[arg(short, long)]
        peer: String,
        /// File hash or unique hash prefix
        #[arg(long)]
        hash: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut cfg = config::load();
    if let Some(host) = cli.directory {
        cfg.directory_host = host;
    }
    if let Some(dir) = cli.shared_dir {
        cfg.shared_dir = dir;
    }

    match cli.command {
        Commands::Directory {
            port,
            discard_probability,
        } => {
            let port = port.unwrap_or(cfg.directory_port);
            let discard = discard_probability.unwrap_or(cfg.discard_probability);
            run_directory(port, discard).await
        }
        Commands::Users => {
            let dir = connect_directory(&cfg).await?;
            for user in dir.users().await? {
                let marker = if user.serving { " (serving)" } else { "" };
                println!("{}{}", user.nick, marker);
            }
            Ok(())
        }
        Commands::Files => {
            let dir = connect_directory(&cfg).await?;
            for f in dir.files().await? {
                println!("{}  {:>12}  {}", f.hash, f.size, f.name);
            }
            Ok(())
        }
        Commands::Serve { nick, port } => serve(&cfg, &nick, port).await,
        Commands::Browse { peer } => {
            let addr = resolve_peer(&cfg, &peer).await?;
            let mut conn = PeerConnector::connect(addr).await?;
            let files = conn.query_files().await?;
            conn.close().await?;
            for f in files {
                println!("{}  {:>12}  {}", f.hash, f.size, f.name);
            }
            Ok(())
        }
        Commands::Download { peer, hash, output } => {
            let addr = resolve_peer(&cfg, &peer).await?;
            let mut conn = PeerConnector::connect(addr).await?;
            let result = conn.download(&hash, &output).await;
            if let Err(e) = conn.close().await {
                warn!("close failed: {}", e);
            }
            let bytes = result?;
            println!("{} bytes written to {}", bytes, output.display());
            Ok(())
        }
    }
}

async fn run_directory(port: u16, discard_probability: f64) -> Result<()> {
    let bind: SocketAddr = ([0, 0, 0, 0], port).into();
    let server = DirectoryServer::bind(bind, discard_probability)
        .await
        .with_context(|| format!("cannot bind directory on {}", bind))?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(stop_rx));
    shutdown_signal().await?;
    let _ = stop_tx.send(true);
    handle.await??;
    Ok(())
}

async fn connect_directory(cfg: &Config) -> Result<DirectoryConnector> {
    let dir = DirectoryConnector::connect(
        &cfg.directory_host,
        cfg.directory_port,
        cfg.request_timeout(),
        cfg.max_attempts,
    )
    .await?;
    let servers = dir.login().await?;
    info!(
        "logged in to directory {} ({} peers serving)",
        dir.directory_addr(),
        servers
    );
    Ok(dir)
}

/// `ip:port` is used as given; anything else is a nickname looked up at the directory.
async fn resolve_peer(cfg: &Config, target: &str) -> Result<SocketAddr> {
    if target.contains(':') {
        return tokio::net::lookup_host(target)
            .await?
            .next()
            .with_context(|| format!("cannot resolve {}", target));
    }
    let dir = connect_directory(cfg).await?;
    match dir.lookup(target).await? {
        Some(addr) => Ok(addr),
        None => bail!("{} is not serving files", target),
    }
}

async fn serve(cfg: &Config, nick: &str, port: u16) -> Result<()> {
    let dir = connect_directory(cfg).await?;
    if !dir.register(nick).await? {
        bail!("nickname {} is already registered", nick);
    }

    let result = publish_and_serve(cfg, &dir, nick, port).await;

    if let Err(e) = dir.logoff(nick).await {
        warn!("logoff failed: {}", e);
    }
    result
}

async fn publish_and_serve(
    cfg: &Config,
    dir: &DirectoryConnector,
    nick: &str,
    port: u16,
) -> Result<()> {
    let shared_dir = cfg.shared_dir.clone();
    let catalog = tokio::task::spawn_blocking(move || shared::scan_folder(&shared_dir))
        .await?
        .with_context(|| format!("cannot scan {}", cfg.shared_dir.display()))?;
    let catalog = Arc::new(catalog);
    let listener =
        PeerListener::bind(port, catalog.clone(), cfg.frame_size, cfg.accept_poll()).await?;
    let local = listener.local_addr()?;

    dir.serve_files(nick, local.port(), catalog.list_local_files())
        .await?;
    info!("{} serving {} files on port {}", nick, catalog.len(), local.port());

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(listener.run(stop_rx));
    shutdown_signal().await?;
    let _ = stop_tx.send(true);
    let served = handle.await??;
    info!("served {} sessions", served);

    match dir.stop_serving(nick).await {
        Ok(_) => {}
        Err(e) if e.is_fatal() => warn!("directory gone, files stay published: {}", e),
        Err(e) => warn!("stop serving failed: {}", e),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
