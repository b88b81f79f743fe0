//! Mount a read-only view of the Nix store restricted to one closure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nixfs_daemon::DaemonClient;
use nixfs_fuse::{AccessPolicy, LoopbackNode, NixFs, Overlay};

#[derive(Debug, Parser)]
#[command(name = "nixfs-mount", version, about)]
struct Args {
    /// Store item whose closure the mount reveals.
    item: String,

    /// Where to mount the filtered view.
    mountpoint: PathBuf,

    /// Path to the daemon socket.
    #[arg(long, default_value = "/nix/var/nix/daemon-socket/socket")]
    daemon_socket_path: PathBuf,

    /// Path to the Nix store.
    #[arg(long, default_value = "/nix/store")]
    store_path: PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // clap exits with 2 on usage errors; keep the historical 1.
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let root_path = args.store_path.join(&args.item);
    let root = root_path
        .to_str()
        .context("store path is not valid UTF-8")?;

    tracing::info!(socket = %args.daemon_socket_path.display(), "connecting to daemon");
    let mut client = DaemonClient::connect(&args.daemon_socket_path).with_context(|| {
        format!(
            "connecting to daemon at {}",
            args.daemon_socket_path.display()
        )
    })?;

    let closure = nixfs_daemon::closure(&mut client, root)
        .with_context(|| format!("resolving the closure of {root}"))?;
    tracing::info!(paths = closure.len(), "closure resolved");

    // The session only serves discovery; close it before the mount begins.
    client.close().context("closing the daemon session")?;

    let policy = AccessPolicy::from_closure(&args.store_path, &closure);
    let overlay = Overlay::new(
        Arc::new(policy),
        Arc::new(LoopbackNode::new(&args.store_path)),
    );

    tracing::info!(mountpoint = %args.mountpoint.display(), "mounting");
    nixfs_fuse::mount(NixFs::new(overlay), &args.mountpoint, &args.item)
        .with_context(|| format!("mounting at {}", args.mountpoint.display()))?;
    Ok(())
}
