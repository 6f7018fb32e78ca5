//! Endpoint discovery through port files.
//!
//! The peer writes the port it listens on to the server port file; we write our
//! bound port to the client port file. The client file doubles as a hint for
//! rebinding the same local port on the next start.

use crate::error::{BridgeError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read a port file; `None` if it does not exist yet
pub async fn read_port(path: &Path) -> Result<Option<u16>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_port(&content)
            .map(Some)
            .ok_or_else(|| {
                BridgeError::Discovery(format!(
                    "{} does not contain a port: {:?}",
                    path.display(),
                    content.trim()
                ))
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BridgeError::Discovery(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write our port so the peer can find us
pub async fn write_port(path: &Path, port: u16) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            BridgeError::Discovery(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    tokio::fs::write(path, port.to_string())
        .await
        .map_err(|e| BridgeError::Discovery(format!("Failed to write {}: {}", path.display(), e)))
}

fn parse_port(content: &str) -> Option<u16> {
    content.trim().parse::<u16>().ok().filter(|port| *port != 0)
}

/// Poll a port file and call `on_change` whenever a new port shows up.
///
/// `last_known` is the port already in use, so it is not reported again.
pub fn spawn_port_watcher<F>(
    path: PathBuf,
    poll_interval: Duration,
    last_known: Option<u16>,
    shutdown: CancellationToken,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(u16) + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = last_known;
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match read_port(&path).await {
                Ok(Some(port)) if Some(port) != last => {
                    log::info!("🔎 Peer port changed: {:?} -> {}", last, port);
                    last = Some(port);
                    on_change(port);
                }
                Ok(_) => {}
                Err(e) => log::debug!("Port file not usable yet: {}", e),
            }
        }

        log::debug!("Port watcher for {} stopped", path.display());
    })
}
