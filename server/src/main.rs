//! weftd: the standalone collaborative editing server.
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_server::accounts::AccountStore;
use weft_server::server::Server;
use weft_server::storage::Storage;
use weft_server::transport::{self, SecurityPolicy};

#[derive(Debug, Parser)]
#[command(name = "weftd", about = "Collaborative text editing server")]
struct Opts {
    /// Port to listen on.
    #[arg(long, default_value_t = 6523)]
    port: u16,

    /// Transport security: no-tls, allow-tls or require-tls.
    #[arg(long, default_value = "allow-tls")]
    security_policy: SecurityPolicy,

    /// PEM file holding the server's private key.
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// PEM file holding the server's certificate chain.
    #[arg(long)]
    certificate_file: Option<PathBuf>,

    /// Directory the document tree is stored under.
    #[arg(long)]
    root_directory: Option<PathBuf>,

    /// Server-wide password admitting clients without an account.
    #[arg(long)]
    password: Option<String>,

    /// Seconds between autosaves of the document tree; 0 disables.
    #[arg(long, default_value_t = 60)]
    autosave_interval: u64,

    /// Directory receiving plain-text copies of every document.
    #[arg(long)]
    sync_directory: Option<PathBuf>,

    /// Seconds between plain-text exports; 0 disables.
    #[arg(long, default_value_t = 300)]
    sync_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let opts = Opts::parse();

    let storage = match &opts.root_directory {
        Some(root) => Some(Storage::open(root.clone())?),
        None => None,
    };
    let accounts = match &storage {
        Some(storage) => AccountStore::open(storage.accounts_path())?,
        None => AccountStore::in_memory(),
    };

    let tls = match (&opts.key_file, &opts.certificate_file) {
        (Some(key), Some(cert)) => Some(transport::tls_acceptor(key, cert)?),
        _ => None,
    };
    match opts.security_policy {
        SecurityPolicy::RequireTls => {
            anyhow::ensure!(
                tls.is_some(),
                "require-tls needs --key-file and --certificate-file"
            );
        }
        SecurityPolicy::NoTls => {}
        SecurityPolicy::AllowTls => {}
    }
    let tls = match opts.security_policy {
        SecurityPolicy::NoTls => None,
        _ => tls,
    };

    let mut server = Server::new("weftd", accounts, storage, opts.password.clone());
    server.load_tree()?;

    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .await
        .with_context(|| format!("binding port {}", opts.port))?;
    info!(
        port = opts.port,
        tls = tls.is_some(),
        "server listening"
    );
    let (events_tx, mut events_rx) = mpsc::channel(1024);
    tokio::spawn(transport::run_listener(listener, tls, events_tx));

    let mut autosave = interval_or_never(opts.autosave_interval);
    let mut sync = interval_or_never(opts.sync_interval);
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => server.handle_event(event),
                    None => break,
                }
            }
            _ = autosave.tick() => {
                server.autosave();
            }
            _ = sync.tick() => {
                if let Some(target) = &opts.sync_directory {
                    server.sync_to_directory(target);
                }
            }
        }
    }
    server.autosave();
    Ok(())
}

/// A ticking interval, or one that effectively never fires.
fn interval_or_never(seconds: u64) -> tokio::time::Interval {
    let period = if seconds == 0 {
        // Far enough out to count as never.
        Duration::from_secs(60 * 60 * 24 * 365)
    } else {
        Duration::from_secs(seconds)
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.reset();
    interval
}
