//! The engine: command facade over the transport, ledger and connection machine.

use crate::cache::{CacheEntry, ResponseCache};
use crate::config::EngineConfig;
use crate::connection::{
    ConnectReason, ConnectionMachine, ConnectionState, DisconnectReason, HeartbeatOutcome,
};
use crate::discovery;
use crate::error::{BridgeError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::ledger::{self, PendingGuard, RequestLedger};
use crate::limiter::ConcurrencyLimiter;
use crate::listeners::{ListenerHandle, ListenerRegistry, PropKey, SubscribeState};
use crate::lock;
use crate::transport::{Transport, RECV_BUFFER};
use bridge_protocol::{
    codec, CacheResponse, Command, MessageFrame, Reassembler, Response, ResponseKind,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Namespace of engine-internal commands (heartbeat)
const INTERNAL_NAMESPACE: &str = "internal";

/// Resources that live between `start()` and `close()`
struct Session {
    transport: Arc<Transport>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: EngineConfig,
    events: EventBus,
    limiter: ConcurrencyLimiter,
    connection: Mutex<ConnectionMachine>,
    ledger: Mutex<RequestLedger>,
    cache: Mutex<Option<ResponseCache>>,
    listeners: Mutex<ListenerRegistry>,
    ping: Mutex<Option<Duration>>,
    connected: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
}

/// Client engine talking to the control-surface script over UDP.
///
/// ```no_run
/// use live_bridge::{Command, Engine, EngineConfig};
/// use std::time::Duration;
///
/// # async fn run() -> live_bridge::Result<()> {
/// let engine = Engine::new(EngineConfig::from_env()?)?;
/// engine.start(Some(Duration::from_secs(10))).await?;
///
/// let tempo = engine.get_prop("song", None, "tempo", false).await?;
/// println!("tempo: {}", tempo);
///
/// engine
///     .send_command(Command::new("song", "start_playing"))
///     .await?;
/// engine.close();
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (connected, _) = watch::channel(false);
        let inner = Inner {
            events: EventBus::default(),
            limiter: ConcurrencyLimiter::new(config.max_concurrency),
            connection: Mutex::new(ConnectionMachine::new()),
            ledger: Mutex::new(RequestLedger::new()),
            cache: Mutex::new(ResponseCache::from_config(&config.cache)),
            listeners: Mutex::new(ListenerRegistry::new()),
            ping: Mutex::new(None),
            connected,
            session: Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Bind, discover the peer and wait until it answers.
    ///
    /// Resolves on the first peer-pushed `connect` or successful heartbeat.
    /// With a `timeout`, gives up with [`BridgeError::StartTimeout`] and closes.
    pub async fn start(&self, timeout: Option<Duration>) -> Result<()> {
        if !lock(&self.inner.connection).begin_start() {
            return Err(BridgeError::AlreadyStarted);
        }
        self.inner.connected.send_replace(false);
        log::info!("🚀 Starting bridge engine");

        let shutdown = match self.inner.open_session().await {
            Ok(shutdown) => shutdown,
            Err(e) => {
                log::error!("❌ Failed to start: {}", e);
                self.close();
                return Err(e);
            }
        };

        match self.inner.wait_until_connected(shutdown, timeout).await {
            Ok(()) => {
                log::info!("✅ Bridge engine started");
                Ok(())
            }
            Err(e) => {
                log::warn!("⚠️  Start aborted: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Local shutdown: stops the heartbeat, releases the socket and forgets
    /// pending requests (they settle with [`BridgeError::Closed`]). No
    /// disconnect event is emitted.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Send a command and wait for its result
    pub async fn send_command(&self, command: Command) -> Result<Value> {
        let timeout = self.inner.config.command_timeout;
        self.inner.execute(command, timeout).await
    }

    /// Send a command whose result may be served from the response cache.
    ///
    /// A known etag is attached; the peer answers with either the cached-copy
    /// marker or fresh data.
    pub async fn send_cached_command(&self, mut command: Command) -> Result<Value> {
        if lock(&self.inner.cache).is_none() {
            return self.send_command(command).await;
        }

        let key = ResponseCache::build_key(&command);
        let known = lock(&self.inner.cache)
            .as_mut()
            .and_then(|cache| cache.get(&key));

        command.etag = known.as_ref().map(|entry| entry.etag.clone());
        command.wants_cache = true;

        let reply = self.send_command(command).await?;
        match CacheResponse::from_value(reply)? {
            CacheResponse::UseCached => known
                .map(|entry| entry.data)
                .ok_or(BridgeError::CacheMissing { key }),
            CacheResponse::Fresh {
                data,
                etag: Some(etag),
            } => {
                if let Some(cache) = lock(&self.inner.cache).as_mut() {
                    cache.set(
                        key,
                        CacheEntry {
                            etag,
                            data: data.clone(),
                        },
                    );
                }
                Ok(data)
            }
            CacheResponse::Fresh { data, etag: None } => Ok(data),
        }
    }

    pub async fn get_prop(
        &self,
        namespace: &str,
        instance_id: Option<&str>,
        prop: &str,
        cache: bool,
    ) -> Result<Value> {
        let command = Command::new(namespace, "get_prop")
            .with_instance_opt(instance_id)
            .with_args(json!({ "prop": prop }));

        if cache {
            self.send_cached_command(command).await
        } else {
            self.send_command(command).await
        }
    }

    pub async fn set_prop(
        &self,
        namespace: &str,
        instance_id: Option<&str>,
        prop: &str,
        value: Value,
    ) -> Result<Value> {
        let command = Command::new(namespace, "set_prop")
            .with_instance_opt(instance_id)
            .with_args(json!({ "prop": prop, "value": value }));
        self.send_command(command).await
    }

    /// Call `callback` with every new value of a property.
    ///
    /// Callbacks for the same property share one subscription on the peer.
    pub async fn add_prop_listener<F>(
        &self,
        namespace: &str,
        instance_id: Option<&str>,
        prop: &str,
        callback: F,
    ) -> Result<ListenerHandle>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let key = PropKey::new(namespace, instance_id, prop);
        let added = lock(&self.inner.listeners).add(key, Arc::new(callback));
        if !added.is_new {
            return subscribed(added.handle, added.state).await;
        }

        let handle = added.handle;
        let pending = PendingSubscription::new(&self.inner.listeners, &handle.event_id);
        let command = Command::new(namespace, "add_listener")
            .with_instance_opt(instance_id)
            .with_args(json!({
                "prop": prop,
                "nsid": instance_id,
                "eventId": handle.event_id,
            }));

        match self.send_command(command).await {
            Ok(Value::String(event_id)) if event_id == handle.event_id => {
                pending.settle(Ok(()));
                log::debug!("Subscribed to {}.{} as {}", namespace, prop, event_id);
                Ok(handle)
            }
            Ok(other) => {
                let error = BridgeError::UnexpectedResponse(format!(
                    "add_listener answered {} instead of event id {}",
                    other, handle.event_id
                ));
                pending.settle(Err(error.to_string()));
                Err(error)
            }
            Err(e) => {
                pending.settle(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Remove a callback; the peer subscription goes with the last one
    pub async fn remove_prop_listener(&self, handle: &ListenerHandle) -> Result<()> {
        if !lock(&self.inner.listeners).remove(handle) {
            return Ok(());
        }

        let key = &handle.key;
        let command = Command::new(key.namespace.as_str(), "remove_listener")
            .with_instance_opt(key.instance_id.as_deref())
            .with_args(json!({ "prop": key.prop, "nsid": key.instance_id }));
        self.send_command(command).await?;

        log::debug!("Unsubscribed {}", handle.event_id);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection).is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.connection).state()
    }

    /// Latest round-trip latency, once any command has completed
    pub fn get_ping(&self) -> Option<Duration> {
        *lock(&self.inner.ping)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport()?.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport().ok().and_then(|t| t.peer())
    }

    /// Requests sent and not yet settled
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.ledger).len()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

/// Wait for the subscription another caller is setting up on the peer
async fn subscribed(
    handle: ListenerHandle,
    mut state: watch::Receiver<SubscribeState>,
) -> Result<ListenerHandle> {
    let outcome = state
        .wait_for(|state| *state != SubscribeState::Pending)
        .await
        .map(|state| (*state).clone());

    let message = match outcome {
        Ok(SubscribeState::Active) => return Ok(handle),
        Ok(SubscribeState::Failed(message)) => message,
        Ok(SubscribeState::Pending) | Err(_) => "subscription was removed".to_string(),
    };
    Err(BridgeError::Subscribe {
        prop: format!("{}.{}", handle.key.namespace, handle.key.prop),
        message,
    })
}

/// A subscribe in flight. Dropped without settling (the caller gave up), it
/// fails the callbacks waiting on it.
struct PendingSubscription<'a> {
    listeners: &'a Mutex<ListenerRegistry>,
    event_id: Option<String>,
}

impl<'a> PendingSubscription<'a> {
    fn new(listeners: &'a Mutex<ListenerRegistry>, event_id: &str) -> Self {
        Self {
            listeners,
            event_id: Some(event_id.to_string()),
        }
    }

    fn settle(mut self, outcome: std::result::Result<(), String>) {
        let Some(event_id) = self.event_id.take() else {
            return;
        };
        let mut listeners = lock(self.listeners);
        match outcome {
            Ok(()) => listeners.activate(&event_id),
            Err(reason) => {
                let dropped = listeners.abandon(&event_id, reason);
                log::debug!("Subscribe {} failed, dropped {} callback(s)", event_id, dropped);
            }
        }
    }
}

impl Drop for PendingSubscription<'_> {
    fn drop(&mut self) {
        if let Some(event_id) = self.event_id.take() {
            lock(self.listeners).abandon(&event_id, "subscribe was cancelled".to_string());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Background tasks hold the inner state; stop them with the handle
        self.inner.close();
    }
}

impl Inner {
    fn transport(&self) -> Result<Arc<Transport>> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.transport.clone())
            .ok_or(BridgeError::NotStarted)
    }

    /// Bind the socket, publish our port and spawn the background tasks
    async fn open_session(self: &Arc<Self>) -> Result<CancellationToken> {
        let ports = &self.config.discovery;
        let client_path = ports.client_port_path();
        let server_path = ports.server_port_path();

        let hint = discovery::read_port(&client_path)
            .await
            .unwrap_or_else(|e| {
                log::warn!("⚠️  Ignoring local port hint: {}", e);
                None
            });

        let transport = Arc::new(
            Transport::bind(
                self.config.host,
                hint,
                self.config.max_chunk_size,
                self.config.chunk_pacing,
            )
            .await?,
        );
        discovery::write_port(&client_path, transport.local_addr()?.port()).await?;

        let server_port = discovery::read_port(&server_path).await.unwrap_or_else(|e| {
            log::warn!("⚠️  {}", e);
            None
        });
        match server_port {
            Some(port) => transport.set_peer_port(port),
            None => log::info!("⏳ Waiting for peer port in {}", server_path.display()),
        }

        let shutdown = CancellationToken::new();
        let mut session = lock(&self.session);
        if lock(&self.connection).state() != ConnectionState::Starting {
            // close() raced with start()
            return Err(BridgeError::Closed);
        }

        let receiver = tokio::spawn(receive_loop(
            self.clone(),
            transport.clone(),
            shutdown.clone(),
        ));
        let watcher = discovery::spawn_port_watcher(
            server_path,
            ports.poll_interval,
            server_port,
            shutdown.clone(),
            {
                let transport = transport.clone();
                move |port| transport.set_peer_port(port)
            },
        );
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), shutdown.clone()));

        *session = Some(Session {
            transport,
            shutdown: shutdown.clone(),
            tasks: vec![receiver, watcher, heartbeat],
        });
        Ok(shutdown)
    }

    async fn wait_until_connected(
        &self,
        shutdown: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut connected = self.connected.subscribe();
        let wait = async move {
            tokio::select! {
                result = connected.wait_for(|connected| *connected) => {
                    result.map(|_| ()).map_err(|_| BridgeError::Closed)
                }
                _ = shutdown.cancelled() => Err(BridgeError::Closed),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| BridgeError::StartTimeout(limit))?,
            None => wait.await,
        }
    }

    fn close(&self) {
        let session = lock(&self.session).take();
        let was_open = lock(&self.connection).state() != ConnectionState::Closed;

        lock(&self.connection).close();
        self.connected.send_replace(false);
        lock(&self.ledger).clear();
        lock(&self.listeners).clear();

        if let Some(session) = session {
            session.shutdown.cancel();
            for task in session.tasks {
                task.abort();
            }
        }

        if was_open {
            log::info!("🛑 Bridge engine closed");
        }
    }

    /// Limiter, framing, ledger and send: the path every command takes
    async fn execute(&self, command: Command, timeout: Duration) -> Result<Value> {
        let transport = self.transport()?;
        let _admission = self.limiter.admit().await?;

        let message_id = transport.next_message_id();
        let frames = transport.prepare(&command, message_id)?;
        let id = command.id;

        if command.namespace != INTERNAL_NAMESPACE {
            log::debug!(
                "➡️  {} (message {}, {} frame(s))",
                command,
                message_id,
                frames.len()
            );
        }
        let label = self
            .config
            .command_warn_threshold
            .map(|_| command.to_string());

        let rx = lock(&self.ledger).register(command, message_id, timeout);
        let _pending = PendingGuard::new(&self.ledger, id);
        let started = Instant::now();
        if let Err(e) = transport.send_frames(&frames).await {
            lock(&self.ledger).fail(&id, e);
        }

        let result = ledger::wait_for(&self.ledger, id, rx).await;

        if let (Some(threshold), Some(label)) = (self.config.command_warn_threshold, label) {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                log::warn!("🐢 {} took {:?}", label, elapsed);
            }
        }
        result
    }

    async fn probe(&self) -> Result<Value> {
        let command =
            Command::new(INTERNAL_NAMESPACE, "get_prop").with_args(json!({ "prop": "ping" }));
        let timeout = self.config.heartbeat_interval.min(self.config.command_timeout);
        self.execute(command, timeout).await
    }

    fn handle_datagram(
        &self,
        transport: &Transport,
        reassembler: &mut Reassembler,
        datagram: &[u8],
    ) {
        let frame = match MessageFrame::parse(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                self.events.error(format!("Dropping malformed datagram: {}", e));
                return;
            }
        };

        let message_id = frame.header.message_id;
        lock(&self.ledger).reset_timeout(message_id);

        let Some(bytes) = reassembler.push(frame) else {
            return;
        };

        match codec::decode::<Response>(&bytes) {
            Ok(response) => self.dispatch(transport, response),
            Err(e) => self
                .events
                .error(format!("Dropping undecodable message {}: {}", message_id, e)),
        }
    }

    fn dispatch(&self, transport: &Transport, response: Response) {
        self.events.emit(EngineEvent::Message(response.clone()));

        let command_id = response.command_id();
        let Response { id, kind, data } = response;

        match kind {
            ResponseKind::Result => {
                let latency = command_id.and_then(|cid| lock(&self.ledger).resolve(&cid, data));
                match latency {
                    Some(latency) => {
                        *lock(&self.ping) = Some(latency);
                        self.events.emit(EngineEvent::Ping(latency));
                    }
                    None => self.unroutable("result", id.as_deref()),
                }
            }
            ResponseKind::Error => {
                let message = match data {
                    Value::String(message) => message,
                    other => other.to_string(),
                };
                let rejected = command_id
                    .map(|cid| lock(&self.ledger).reject(&cid, message))
                    .unwrap_or(false);
                if !rejected {
                    self.unroutable("error", id.as_deref());
                }
            }
            ResponseKind::Connect => {
                if let Some(port) = data
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|port| u16::try_from(port).ok())
                {
                    transport.set_peer_port(port);
                }

                let reason = {
                    let mut connection = lock(&self.connection);
                    connection.cancel_heartbeats();
                    connection.handle_connect(ConnectReason::Realtime)
                };
                if let Some(reason) = reason {
                    self.on_connected(reason);
                }
            }
            ResponseKind::Disconnect => {
                let reason = lock(&self.connection).handle_disconnect(DisconnectReason::Realtime);
                if let Some(reason) = reason {
                    self.on_disconnected(reason);
                }
            }
            ResponseKind::Event(event_id) => {
                let callbacks = lock(&self.listeners).callbacks(&event_id);
                match callbacks {
                    Some(callbacks) => {
                        for callback in callbacks {
                            callback(data.clone());
                        }
                    }
                    None => self.unroutable(&event_id, id.as_deref()),
                }
            }
        }
    }

    fn unroutable(&self, kind: &str, id: Option<&str>) {
        self.events.error(format!(
            "No pending request or subscription for '{}' response (uuid {})",
            kind,
            id.unwrap_or("none")
        ));
    }

    fn on_connected(&self, reason: ConnectReason) {
        log::info!("🔗 Connected ({})", reason);
        self.connected.send_replace(true);
        self.events.emit(EngineEvent::Connect(reason));
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        log::info!("🔌 Disconnected ({})", reason);
        self.connected.send_replace(false);

        let dropped = lock(&self.listeners).clear();
        if dropped > 0 {
            log::debug!("Dropped {} property subscription(s)", dropped);
        }
        self.events.emit(EngineEvent::Disconnect(reason));

        if reason == DisconnectReason::Realtime {
            let purged = lock(&self.ledger).purge();
            if purged > 0 {
                log::warn!("⚠️  Rejected {} pending request(s) on disconnect", purged);
            }
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, transport: Arc<Transport>, shutdown: CancellationToken) {
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = transport.recv(&mut buf) => received,
        };

        match received {
            Ok((len, from)) => {
                log::trace!("⬅️  {} bytes from {}", len, from);
                inner.handle_datagram(&transport, &mut reassembler, &buf[..len]);
            }
            Err(e) => log::warn!("⚠️  UDP receive failed: {}", e),
        }
    }

    log::debug!("Receive loop stopped");
}

/// Probe the peer every interval. Each probe runs as its own task, so a slow
/// peer does not delay the next one.
async fn heartbeat_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ticket = lock(&inner.connection).begin_heartbeat();
        let inner = inner.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = inner.probe() => result,
            };
            if let Err(e) = &result {
                log::debug!("Heartbeat failed: {}", e);
            }

            let outcome = lock(&inner.connection).finish_heartbeat(&ticket, result.is_ok());
            match outcome {
                HeartbeatOutcome::Connected(reason) => inner.on_connected(reason),
                HeartbeatOutcome::Disconnected(reason) => inner.on_disconnected(reason),
                HeartbeatOutcome::Cancelled => {
                    log::debug!("Heartbeat failure superseded by a realtime connect")
                }
                HeartbeatOutcome::Unchanged => {}
            }
        });
    }

    log::debug!("Heartbeat loop stopped");
}
