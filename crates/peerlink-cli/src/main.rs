//! Peerlink CLI - host a demo peer or call one through a lazy manager.
//!
//! `peerlink serve` hosts an echo peer on loopback. `peerlink call` sends a
//! batch of requests to it through a `PeerManager`, which connects on the
//! first request and lets go of the connection once the batch is idle.

mod echo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use peerlink::ipc::{IpcServer, RpcCall, TcpConnector};
use peerlink::{NoopObserver, PeerConfig, PeerError, PeerManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "Lazy connection manager for remote peers")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host an echo peer answering ping, echo and sleep
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },

    /// Send requests to a peer through a lazy manager
    Call {
        /// Address of the peer
        #[arg(long)]
        addr: SocketAddr,

        /// Number of requests to submit
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Method to call
        #[arg(short, long, default_value = "ping")]
        method: String,

        /// JSON parameters for each call
        #[arg(long, default_value = "{}")]
        params: String,

        /// Idle unbind timeout in milliseconds (0 = never unbind)
        #[arg(long)]
        idle_ms: Option<u64>,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// JSON file with manager settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(cli.debug, directives.as_deref()))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Command::Serve { port } => serve(port).await,
        Command::Call {
            addr,
            count,
            method,
            params,
            idle_ms,
            timeout_ms,
            config,
        } => {
            let config = load_config(config, idle_ms, timeout_ms)?;
            let params = serde_json::from_str(&params).context("--params is not valid JSON")?;
            call(addr, count, &method, params, config).await
        }
    }
}

/// `RUST_LOG`-style directives win; otherwise `--debug` picks the level.
fn log_filter(debug: bool, directives: Option<&str>) -> EnvFilter {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives.unwrap_or_default())
}

async fn serve(port: u16) -> Result<()> {
    let mut server = IpcServer::start_on_port(Arc::new(echo::EchoPeer), port).await?;

    // Print the address on stdout so scripts can pick it up
    println!("{}", server.addr());
    info!("Echo peer listening on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown();
    server.join().await;
    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
    idle_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> Result<PeerConfig> {
    let mut config = match path {
        Some(path) => PeerConfig::from_path(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PeerConfig::default(),
    };

    if let Some(ms) = idle_ms {
        config = config.with_idle_timeout((ms > 0).then(|| Duration::from_millis(ms)));
    }
    if let Some(ms) = timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }

    config.validate()?;
    Ok(config)
}

async fn call(
    addr: SocketAddr,
    count: usize,
    method: &str,
    params: serde_json::Value,
    config: PeerConfig,
) -> Result<()> {
    let unbinds_when_idle = config.idle_timeout.is_some();
    let peer = PeerManager::new(
        TcpConnector::identity_for(addr, "Echo", 0),
        Arc::new(TcpConnector::new()),
        config,
        Arc::new(NoopObserver),
    )?;

    let replies: Vec<_> = (0..count)
        .map(|_| {
            let (call, reply) = RpcCall::new(method, params.clone());
            peer.submit(call);
            reply
        })
        .collect();

    let mut failures = 0;
    for (index, reply) in join_all(replies).await.into_iter().enumerate() {
        match reply {
            Ok(Ok(value)) => println!("#{} {}", index, value),
            Ok(Err(PeerError::Timeout(timeout))) => {
                failures += 1;
                println!("#{} timed out after {:?}", index, timeout);
            }
            Ok(Err(e)) => {
                failures += 1;
                println!("#{} failed: {}", index, e);
            }
            Err(_) => {
                failures += 1;
                println!("#{} dropped without a reply", index);
            }
        }
    }

    if unbinds_when_idle {
        let mut status = peer.subscribe();
        status
            .wait_for(|s| !s.is_bound() || s.destroyed)
            .await
            .context("Manager stopped before unbinding")?;
    } else {
        warn!("Idle unbind disabled; destroying the manager");
        peer.destroy();
    }
    peer.barrier().await;

    print!("{}", peer.status());

    if failures > 0 {
        anyhow::bail!("{} of {} requests failed", failures, count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call_flags() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "--debug",
            "call",
            "--addr",
            "127.0.0.1:7400",
            "--count",
            "3",
            "--idle-ms",
            "0",
        ])
        .unwrap();

        assert!(cli.debug);
        match cli.command {
            Command::Call {
                addr,
                count,
                method,
                idle_ms,
                ..
            } => {
                assert_eq!(addr.port(), 7400);
                assert_eq!(count, 3);
                assert_eq!(method, "ping");
                assert_eq!(idle_ms, Some(0));
            }
            other => panic!("Expected call, got: {:?}", other),
        }
    }

    #[test]
    fn test_log_filter_defaults_to_debug_flag() {
        assert_eq!(log_filter(false, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(true, None).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(true, Some("")).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_log_filter_honors_directives() {
        assert_eq!(log_filter(true, Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
        let filter = log_filter(false, Some("peerlink=trace"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_idle_zero_disables_unbind() {
        let config = load_config(None, Some(0), Some(250)).unwrap();
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.json");
        let json = serde_json::to_string(&PeerConfig::default().with_allow_instant(true)).unwrap();
        std::fs::write(&path, json).unwrap();

        let config = load_config(Some(path), Some(1500), None).unwrap();
        assert!(config.allow_instant);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_call_against_echo_peer() {
        let mut server = IpcServer::start(Arc::new(echo::EchoPeer)).await.unwrap();
        let config = PeerConfig::default()
            .with_idle_timeout(Some(Duration::from_millis(50)))
            .with_request_timeout(Duration::from_secs(2));

        call(server.addr(), 2, "echo", serde_json::json!({"x": 1}), config)
            .await
            .unwrap();

        server.shutdown();
    }
}
