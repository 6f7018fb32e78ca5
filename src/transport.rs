//! UDP socket ownership and the datagram send path.

use crate::error::{BridgeError, Result};
use bridge_protocol::codec::{self, HEADER_LEN};
use bridge_protocol::{Command, MessageFrame};
use socket2::SockRef;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65_507;

/// Receive buffer size, large enough for any datagram
pub const RECV_BUFFER: usize = 65_536;

/// Room left in the send buffer for kernel bookkeeping
const SEND_BUFFER_HEADROOM: usize = 100;

const MIN_CHUNK_SIZE: usize = 512;

/// Chunk payload size for a given socket send-buffer size
pub fn derive_max_payload(send_buffer: usize) -> usize {
    send_buffer
        .min(MAX_DATAGRAM)
        .saturating_sub(HEADER_LEN + SEND_BUFFER_HEADROOM)
        .max(MIN_CHUNK_SIZE)
}

pub struct Transport {
    socket: UdpSocket,
    host: IpAddr,
    peer: RwLock<Option<SocketAddr>>,
    next_message_id: AtomicU8,
    max_payload: usize,
    chunk_pacing: Duration,
}

impl Transport {
    /// Bind on `host`, preferring `preferred_port` (last session's port) when free
    pub async fn bind(
        host: IpAddr,
        preferred_port: Option<u16>,
        max_chunk_size: Option<usize>,
        chunk_pacing: Duration,
    ) -> Result<Self> {
        let socket = match preferred_port {
            Some(port) => match UdpSocket::bind((host, port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    log::info!("Port {} unavailable ({}), binding a new one", port, e);
                    UdpSocket::bind((host, 0)).await?
                }
            },
            None => UdpSocket::bind((host, 0)).await?,
        };

        let max_payload = match max_chunk_size {
            Some(size) => size.min(MAX_DATAGRAM - HEADER_LEN),
            None => derive_max_payload(SockRef::from(&socket).send_buffer_size()?),
        };

        log::info!(
            "📡 Bound UDP socket on {} (chunk size {} bytes)",
            socket.local_addr()?,
            max_payload
        );

        Ok(Self {
            socket,
            host,
            peer: RwLock::new(None),
            next_message_id: AtomicU8::new(0),
            max_payload,
            chunk_pacing,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Point the send path at a (possibly new) peer port
    pub fn set_peer_port(&self, port: u16) {
        let addr = SocketAddr::new(self.host, port);
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        if *peer != Some(addr) {
            log::info!("🎯 Sending to peer at {}", addr);
            *peer = Some(addr);
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Next transport message id (wraps at 256)
    pub fn next_message_id(&self) -> u8 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Compress and split a command into frames
    pub fn prepare(&self, command: &Command, message_id: u8) -> Result<Vec<MessageFrame>> {
        let bytes = codec::encode(command)?;
        Ok(codec::frame(&bytes, message_id, self.max_payload)?)
    }

    /// Send all frames of one message, pacing consecutive chunks
    pub async fn send_frames(&self, frames: &[MessageFrame]) -> Result<()> {
        let peer = self.peer().ok_or(BridgeError::NoPeer)?;

        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !self.chunk_pacing.is_zero() {
                tokio::time::sleep(self.chunk_pacing).await;
            }
            self.socket.send_to(&frame.to_bytes(), peer).await?;
        }

        if frames.len() > 1 {
            log::debug!(
                "Sent message {} in {} chunks to {}",
                frames[0].header.message_id,
                frames.len(),
                peer
            );
        }
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::Reassembler;
    use serde_json::json;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    #[test]
    fn test_derive_max_payload() {
        assert_eq!(derive_max_payload(9216), 9216 - 103);
        assert_eq!(derive_max_payload(212_992), MAX_DATAGRAM - 103);
        assert_eq!(derive_max_payload(10), MIN_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_message_ids_wrap() {
        let transport = Transport::bind(LOCALHOST, None, Some(1024), Duration::ZERO)
            .await
            .unwrap();

        let first = transport.next_message_id();
        for _ in 0..255 {
            transport.next_message_id();
        }
        assert_eq!(transport.next_message_id(), first);
    }

    #[tokio::test]
    async fn test_send_without_peer() {
        let transport = Transport::bind(LOCALHOST, None, Some(1024), Duration::ZERO)
            .await
            .unwrap();
        let frames = transport.prepare(&Command::new("song", "undo"), 0).unwrap();

        assert!(matches!(
            transport.send_frames(&frames).await,
            Err(BridgeError::NoPeer)
        ));
    }

    #[tokio::test]
    async fn test_preferred_port_falls_back() {
        let taken = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let transport = Transport::bind(LOCALHOST, Some(port), None, Duration::ZERO)
            .await
            .unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_chunked_send_arrives_complete() {
        let receiver = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let transport = Transport::bind(LOCALHOST, None, Some(64), Duration::from_millis(1))
            .await
            .unwrap();
        transport.set_peer_port(port);

        let words: Vec<String> = (0..200).map(|i| format!("item-{}-{}", i, i * 7919)).collect();
        let command = Command::new("browser", "load").with_args(json!({ "items": words }));
        let frames = transport.prepare(&command, 77).unwrap();
        assert!(frames.len() > 1);
        transport.send_frames(&frames).await.unwrap();

        let mut reassembler = Reassembler::new();
        let mut buf = vec![0u8; RECV_BUFFER];
        let bytes = loop {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let frame = MessageFrame::parse(&buf[..len]).unwrap();
            assert_eq!(frame.header.message_id, 77);
            if let Some(bytes) = reassembler.push(frame) {
                break bytes;
            }
        };

        let decoded: Command = codec::decode(&bytes).unwrap();
        assert_eq!(decoded, command);
    }
}
