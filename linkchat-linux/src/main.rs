// Link-Chat Linux: chat, discovery and file transfer over raw Ethernet frames.

mod config;
mod console;
mod discovery;
mod dispatcher;
mod engine;
mod link;
mod materialize;
mod sender;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use linkchat_core::PeerRegistry;
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::link::RawLink;
use crate::materialize::ZipMaterializer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut interface = None;
    let mut unattended = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("linkchat {}", VERSION);
                return Ok(());
            }
            "--interface" | "-i" => {
                interface = Some(args.next().context("--interface needs a name")?);
            }
            "--unattended" => unattended = true,
            other => anyhow::bail!("unknown argument {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(config::Flags {
        interface,
        unattended,
    })?;
    let interface = match cfg.interface.clone() {
        Some(i) => i,
        None => link::default_interface().context("choosing a network interface")?,
    };
    let local = link::hardware_address(&interface)
        .with_context(|| format!("reading hardware address of {interface}"))?;
    std::fs::create_dir_all(&cfg.download_dir)
        .with_context(|| format!("creating {}", cfg.download_dir.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let link = RawLink::open(&interface)
            .with_context(|| format!("opening raw socket on {interface} (needs root or CAP_NET_RAW)"))?;
        let materializer = if cfg.fix_ownership {
            ZipMaterializer::from_sudo_env()
        } else {
            ZipMaterializer::new()
        };
        let (engine, events) = Engine::new(
            Arc::new(link),
            local,
            cfg.settings(),
            PeerRegistry::with_aliases(cfg.aliases.clone()),
            Arc::new(materializer),
        );
        tracing::info!(%interface, %local, "link-chat {}", VERSION);
        let tasks = engine.start();
        let outcome = tokio::select! {
            r = console::run_console(engine.clone(), events) => r,
            r = shutdown_signal() => r,
        };
        tasks.shutdown();
        outcome
    });
    // stdin reads park a blocking thread; don't wait on it.
    rt.shutdown_timeout(Duration::from_millis(200));
    result
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutting down");
    Ok(())
}
