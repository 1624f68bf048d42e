//! `sandbox_httpd <ROOT> <REGISTRY> [PORT]`

use clap::Parser;
use sandbox_httpd::{
    bind_listener,
    limits::{BufferLimits, ConnLimits, ServerLimits},
    Error, PeerRegistry, Server,
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sandbox_httpd", version)]
#[command(about = "Serves files from ROOT and redirects misses to peers listed in REGISTRY", long_about = None)]
struct Args {
    /// Document root. Must be an existing directory
    root: PathBuf,

    /// Peer registry, one `TARGET<TAB>HOST<TAB>PORT` entry per line
    registry: PathBuf,

    /// Port to listen on, on all interfaces
    #[arg(default_value_t = 8080)]
    port: u16,

    /// Number of connections served concurrently
    #[arg(long, default_value_t = 100)]
    workers: usize,

    /// Seconds to wait for the next chunk of a request
    #[arg(long, default_value_t = 30)]
    read_timeout: u64,

    /// Seconds allowed for a single response write
    #[arg(long, default_value_t = 30)]
    write_timeout: u64,

    /// Largest accepted request head, in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_header_bytes: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_httpd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    check_root(&args.root).await?;
    check_registry(&args.registry).await?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = bind_listener(addr)?;

    tracing::info!(
        address = %addr,
        root = %args.root.display(),
        registry = %args.registry.display(),
        workers = args.workers,
        "Listening for connections"
    );

    Server::builder()
        .listener(listener)
        .root(args.root)
        .lookup(PeerRegistry::new(args.registry))
        .server_limits(ServerLimits {
            max_connections: args.workers,
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            socket_read_timeout: Duration::from_secs(args.read_timeout),
            socket_write_timeout: Duration::from_secs(args.write_timeout),
        })
        .buffer_limits(BufferLimits {
            max_capacity: args.max_header_bytes,
            ..BufferLimits::default()
        })
        .build()
        .launch()
        .await;

    Ok(())
}

async fn check_root(root: &Path) -> Result<(), Error> {
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|source| Error::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;

    if !meta.is_dir() {
        return Err(Error::RootNotDirectory(root.to_path_buf()));
    }
    Ok(())
}

async fn check_registry(registry: &Path) -> Result<(), Error> {
    tokio::fs::File::open(registry)
        .await
        .map(drop)
        .map_err(|source| Error::InvalidRegistry {
            path: registry.to_path_buf(),
            source,
        })
}
