//! treesyncd: serve a directory tree or pull one over TCP.
//!
//!   treesyncd serve <root> [listen-addr]
//!   treesyncd pull <addr> <dest>

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use treesync::{ReceiveOpt, SendOpt};
use treesync_core::TreesyncConfig;

const USAGE: &str = "usage: treesyncd serve <root> [listen-addr] | treesyncd pull <addr> <dest>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TreesyncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TreesyncConfig::load().context("failed to load config")?;

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["serve", root] => serve(&config, PathBuf::from(root), &config.server.listen, shutdown).await,
        ["serve", root, listen] => serve(&config, PathBuf::from(root), listen, shutdown).await,
        ["pull", addr, dest] => pull(&config, addr, PathBuf::from(dest), shutdown).await,
        _ => bail!(USAGE),
    }
}

async fn serve(config: &TreesyncConfig, root: PathBuf, listen: &str, shutdown: CancellationToken) -> Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(addr = %listener.local_addr()?, root = %root.display(), "serving tree");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted.context("accept failed")?,
        };
        tracing::info!(%peer, "peer connected");

        let root = root.clone();
        let mut opt = SendOpt::from_config(&config.tuning);
        opt.cancel = shutdown.child_token();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match treesync::send(reader, writer, &root, opt).await {
                Ok(()) => tracing::info!(%peer, "transfer complete"),
                Err(e) => tracing::error!(%peer, error = %e, "transfer failed"),
            }
        });
    }
    tracing::info!("treesyncd stopped");
    Ok(())
}

async fn pull(config: &TreesyncConfig, addr: &str, dest: PathBuf, shutdown: CancellationToken) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    tracing::info!(%addr, dest = %dest.display(), diff = ?config.receive.diff, "pulling tree");

    let mut opt = ReceiveOpt::from_config(&config.receive, &config.tuning);
    opt.cancel = shutdown;
    opt.progress = Some(std::sync::Arc::new(|bytes, done| {
        if done {
            tracing::info!(bytes, "received");
        } else {
            tracing::debug!(bytes, "progress");
        }
    }));

    let (reader, writer) = stream.into_split();
    treesync::receive(reader, writer, &dest, opt)
        .await
        .with_context(|| format!("failed to receive into {}", dest.display()))?;
    Ok(())
}
