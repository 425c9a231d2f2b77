// Cascade mesh daemon: one overlay node over TCP.

mod config;
mod transport;

use cascade_core::{MeshNode, PeerAddr, Protocol, Registry};
use tracing::warn;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("cascade-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let out_addr = match &cfg.out_addr {
        Some(s) => parse_addr(s)
            .ok_or_else(|| anyhow::anyhow!("invalid out_addr {s:?} (expected host:port)"))?,
        None => PeerAddr::new(cfg.addr.clone(), cfg.port),
    };
    let bootstrap: Vec<PeerAddr> = cfg
        .bootstrap
        .iter()
        .filter_map(|s| {
            let parsed = parse_addr(s);
            if parsed.is_none() {
                warn!(peer = %s, "ignoring malformed bootstrap entry");
            }
            parsed
        })
        .collect();

    let node = MeshNode::new(
        Protocol::new(cfg.subnet.clone(), "Plaintext"),
        out_addr,
        Registry::with_defaults(),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            result = transport::run(node, (cfg.addr.clone(), cfg.port), bootstrap) => {
                result.map_err(anyhow::Error::from)
            }
            result = shutdown_signal() => result,
        }
    })
}

fn parse_addr(s: &str) -> Option<PeerAddr> {
    let (host, port) = s.rsplit_once(':')?;
    Some(PeerAddr::new(host, port.parse::<u16>().ok()?))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
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
