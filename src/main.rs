use anyhow::{Context, Result};
use clap::Parser;
use live_bridge::{Engine, EngineConfig, EngineEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to the control surface and report connection health", long_about = None)]
struct Args {
    /// Seconds to wait for the first connection (waits forever if omitted)
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory holding the port files (defaults to the OS temp dir)
    #[arg(long)]
    port_dir: Option<PathBuf>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Print every inbound message, not just connection events
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = EngineConfig::from_env().context("Invalid configuration")?;
    if let Some(dir) = args.port_dir {
        config.discovery.directory = dir;
    }
    if let Some(ms) = args.heartbeat_ms {
        config.heartbeat_interval = Duration::from_millis(ms);
    }

    let engine = Engine::new(config).context("Failed to create engine")?;
    let mut events = engine.subscribe();

    println!(
        "🔎 Looking for the peer port in {}",
        engine.config().discovery.server_port_path().display()
    );
    engine
        .start(args.timeout.map(Duration::from_secs))
        .await
        .context("Failed to connect")?;
    println!("✅ Connected (local {})", engine.local_addr()?);
    println!("   Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Received Ctrl+C, shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::Connect(reason)) => println!("🔗 connect ({})", reason),
                Ok(EngineEvent::Disconnect(reason)) => println!("🔌 disconnect ({})", reason),
                Ok(EngineEvent::Ping(latency)) => println!("🏓 ping {:?}", latency),
                Ok(EngineEvent::Error(message)) => println!("⚠️  {}", message),
                Ok(EngineEvent::Message(response)) if args.verbose => {
                    println!("⬅️  {}: {}", String::from(response.kind), response.data)
                }
                Ok(EngineEvent::Message(_)) => {}
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.close();
    Ok(())
}
