//! UDP stand-in for the control-surface script.
//!
//! Publishes its port through the server port file in a temp directory, decodes
//! incoming commands and answers them through a scriptable handler. Heartbeat
//! probes are answered separately so tests can switch them off.

#![allow(dead_code)]

use bridge_protocol::{codec, Command, MessageFrame, Reassembler, Response};
use live_bridge::{DiscoveryConfig, EngineConfig, EngineEvent};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// How the peer answers one command
pub enum Reply {
    Result(Value),
    Error(String),
    Delayed(Duration, Value),
    DelayedError(Duration, String),
    Silent,
}

pub type Handler = Arc<dyn Fn(&Command) -> Reply + Send + Sync>;

struct Shared {
    socket: UdpSocket,
    dir: PathBuf,
    client: Mutex<Option<SocketAddr>>,
    handler: Mutex<Handler>,
    commands: Mutex<Vec<Command>>,
    answer_pings: AtomicBool,
    pings: AtomicUsize,
    chunk_size: AtomicUsize,
    chunk_delay_ms: AtomicU64,
    reverse_chunks: AtomicBool,
    next_push_id: AtomicU8,
}

pub struct MockPeer {
    shared: Arc<Shared>,
    _dir: Option<TempDir>,
    task: JoinHandle<()>,
}

impl MockPeer {
    /// Start a peer in a fresh temp directory
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut peer = Self::start_in(dir.path()).await;
        peer._dir = Some(dir);
        peer
    }

    /// Start a peer that publishes its port in `dir`
    pub async fn start_in(dir: &Path) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind mock peer");
        let port = socket.local_addr().unwrap().port();
        write_port_file(&dir.join(DiscoveryConfig::default().server_port_file), port);

        let shared = Arc::new(Shared {
            socket,
            dir: dir.to_path_buf(),
            client: Mutex::new(None),
            handler: Mutex::new(Arc::new(|_: &Command| Reply::Result(Value::Null))),
            commands: Mutex::new(Vec::new()),
            answer_pings: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            chunk_size: AtomicUsize::new(8192),
            chunk_delay_ms: AtomicU64::new(0),
            reverse_chunks: AtomicBool::new(false),
            next_push_id: AtomicU8::new(128),
        });

        let task = tokio::spawn(serve(shared.clone()));
        Self {
            shared,
            _dir: None,
            task,
        }
    }

    /// Engine config pointing at this peer, with short timings for tests
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            heartbeat_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(1),
            discovery: DiscoveryConfig {
                directory: self.shared.dir.clone(),
                poll_interval: Duration::from_millis(50),
                ..DiscoveryConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.socket.local_addr().unwrap()
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Command) -> Reply + Send + Sync + 'static,
    {
        *self.shared.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.shared.answer_pings.store(answer, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.shared.chunk_size.store(size, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.shared
            .chunk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_reverse_chunks(&self, reverse: bool) {
        self.shared.reverse_chunks.store(reverse, Ordering::SeqCst);
    }

    /// Non-heartbeat commands received so far
    pub fn commands(&self) -> Vec<Command> {
        self.shared.commands.lock().unwrap().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|command| command.name == name)
            .collect()
    }

    /// Where the engine listens: learned from traffic, else from its port file
    pub fn client_addr(&self) -> SocketAddr {
        if let Some(addr) = *self.shared.client.lock().unwrap() {
            return addr;
        }
        let path = self
            .shared
            .dir
            .join(DiscoveryConfig::default().client_port_file);
        let port: u16 = std::fs::read_to_string(&path)
            .expect("client port file")
            .trim()
            .parse()
            .expect("client port");
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Push an unsolicited message (connect, disconnect, property event)
    pub async fn push(&self, response: Response) {
        let bytes = codec::encode(&response).expect("encode push");
        self.push_bytes(&bytes).await;
    }

    /// Push an already compressed payload
    pub async fn push_bytes(&self, bytes: &[u8]) {
        let message_id = self.shared.next_push_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .send_bytes(bytes, message_id, self.client_addr())
            .await;
    }

    /// Send a raw datagram, header and all
    pub async fn push_datagram(&self, datagram: &[u8]) {
        self.shared
            .socket
            .send_to(datagram, self.client_addr())
            .await
            .expect("send datagram");
    }

    /// Pretend the peer restarted on another port
    pub fn publish_port(&self, port: u16) {
        write_port_file(
            &self
                .shared
                .dir
                .join(DiscoveryConfig::default().server_port_file),
            port,
        );
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Shared {
    async fn send(&self, response: &Response, message_id: u8, to: SocketAddr) {
        let bytes = codec::encode(response).expect("encode response");
        self.send_bytes(&bytes, message_id, to).await;
    }

    async fn send_bytes(&self, bytes: &[u8], message_id: u8, to: SocketAddr) {
        let chunk_size = self.chunk_size.load(Ordering::SeqCst);
        let mut frames = codec::frame(bytes, message_id, chunk_size).expect("frame response");
        if self.reverse_chunks.load(Ordering::SeqCst) {
            frames.reverse();
        }

        let delay = Duration::from_millis(self.chunk_delay_ms.load(Ordering::SeqCst));
        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = self.socket.send_to(&frame.to_bytes(), to).await;
        }
    }
}

async fn serve(shared: Arc<Shared>) {
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; 65_536];

    loop {
        let Ok((len, from)) = shared.socket.recv_from(&mut buf).await else {
            continue;
        };
        *shared.client.lock().unwrap() = Some(from);

        let Ok(frame) = MessageFrame::parse(&buf[..len]) else {
            continue;
        };
        let message_id = frame.header.message_id;
        let Some(bytes) = reassembler.push(frame) else {
            continue;
        };
        let Ok(command) = codec::decode::<Command>(&bytes) else {
            continue;
        };

        if command.namespace == "internal" {
            shared.pings.fetch_add(1, Ordering::SeqCst);
            if shared.answer_pings.load(Ordering::SeqCst) {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let response = Response::result(command.id, json!(true));
                    shared.send(&response, message_id, from).await;
                });
            }
            continue;
        }

        shared.commands.lock().unwrap().push(command.clone());
        let handler = shared.handler.lock().unwrap().clone();
        let reply = handler(&command);

        let shared = shared.clone();
        tokio::spawn(async move {
            let response = match reply {
                Reply::Result(data) => Response::result(command.id, data),
                Reply::Error(message) => Response::error(command.id, message),
                Reply::Delayed(delay, data) => {
                    tokio::time::sleep(delay).await;
                    Response::result(command.id, data)
                }
                Reply::DelayedError(delay, message) => {
                    tokio::time::sleep(delay).await;
                    Response::error(command.id, message)
                }
                Reply::Silent => return,
            };
            shared.send(&response, message_id, from).await;
        });
    }
}

/// Write via rename so a polling reader never sees a half-written port
fn write_port_file(path: &Path, port: u16) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, port.to_string()).expect("write port file");
    std::fs::rename(&tmp, path).expect("publish port file");
}

/// Next event matching `matches`, or `None` once `within` has passed
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<EngineEvent>,
    within: Duration,
    mut matches: F,
) -> Option<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if matches(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Poll `condition` until it holds or `within` has passed
pub async fn wait_until<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
