//! Session management
//!
//! A [`SessionManager`] runs at most one streaming session at a time, as
//! either server or client, plus an optional discovery listener. Each
//! session is a handful of tokio tasks sharing one [`StopSignal`]; stopping
//! the session triggers it and joins every task after its device and socket
//! have been released.

pub mod signal;

pub use signal::StopSignal;

use futures_util::future::join_all;
use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioDeviceProvider, CaptureLine, DeviceId, PlaybackLine};
use crate::config::{validate_port, AppConfig, AudioFormat, NetworkConfig};
use crate::error::{AudioError, ConfigError, Error, ProtocolError, Result, SessionError};
use crate::network::discovery::{local_hostname, run_beacon, run_listener};
use crate::network::handshake::{accept_client, connect_to_server, HandshakeOutcome};
use crate::network::udp::{bind_ephemeral, bind_multicast, bind_reusable, multicast_sender};
use crate::pipeline::mic_relay::{spawn_mic_receiver, spawn_mic_sender};
use crate::pipeline::{capture, open_line, playback, Endpoint, PipelineEnd};
use crate::protocol::{Announcement, PeerDescriptor, TransportMode};
use crate::status::{StatusEvent, StatusKey, StatusSink};

/// Opaque session identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Server,
    Client,
}

/// Where the manager is in a session's life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Client discovery listener running, no session
    Discovering,
    /// Unicast server waiting for its client
    Announcing,
    /// Unicast client waiting for the ack
    Handshaking,
    Streaming,
    Stopping,
}

/// Parameters of a server session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub format: AudioFormat,
    pub port: u16,
    pub mode: TransportMode,
    pub capture_device: Option<DeviceId>,
    /// Output for the client's microphone; `None` disables the relay
    pub mic_playback_device: Option<DeviceId>,
    pub mic_port: u16,
}

impl ServerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            format: config.audio,
            port: config.network.streaming_port,
            mode: if config.network.multicast {
                TransportMode::Multicast
            } else {
                TransportMode::Unicast
            },
            capture_device: config.devices.capture.clone(),
            mic_playback_device: config.devices.mic_playback.clone(),
            mic_port: config.network.mic_port,
        }
    }
}

/// Parameters of a client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub format: AudioFormat,
    pub peer: PeerDescriptor,
    pub playback_device: Option<DeviceId>,
    pub send_mic: bool,
    pub mic_capture_device: Option<DeviceId>,
    pub mic_port: u16,
}

impl ClientOptions {
    pub fn from_config(config: &AppConfig, peer: PeerDescriptor) -> Self {
        Self {
            format: config.audio,
            peer,
            playback_device: config.devices.playback.clone(),
            send_mic: config.devices.send_mic,
            mic_capture_device: config.devices.mic_capture.clone(),
            mic_port: config.network.mic_port,
        }
    }
}

/// Tasks of the live session
struct ActiveSession {
    handle: SessionHandle,
    role: SessionRole,
    stop: StopSignal,
    main: JoinHandle<()>,
    helpers: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    /// The main pipeline has ended on its own
    fn is_finished(&self) -> bool {
        self.main.is_finished()
    }

    async fn shutdown(self) {
        self.stop.trigger();

        let mut tasks = self.helpers;
        tasks.push(self.main);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Session {} task failed: {}", self.handle, e);
            }
        }
        tracing::info!("{:?} session {} stopped", self.role, self.handle);
    }
}

struct DiscoveryTask {
    stop: StopSignal,
    task: JoinHandle<()>,
}

/// What every session task needs to report progress
#[derive(Clone)]
struct TaskContext {
    status: Arc<dyn StatusSink>,
    state: Arc<watch::Sender<SessionState>>,
    stop: StopSignal,
}

impl TaskContext {
    fn notify(&self, event: StatusEvent) {
        self.status.notify(event);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Device line and socket acquired before a server session starts
struct ServerResources {
    line: Box<dyn CaptureLine>,
    socket: UdpSocket,
    read_size: usize,
}

/// Device line and endpoint acquired before a client session starts
struct ClientResources {
    line: Box<dyn PlaybackLine>,
    endpoint: Endpoint,
}

/// Where the client's microphone goes once streaming
struct MicRoute {
    provider: Arc<dyn AudioDeviceProvider>,
    format: AudioFormat,
    device: Option<DeviceId>,
    dest: SocketAddr,
}

/// Owner of the streaming session and the discovery listener
pub struct SessionManager {
    provider: Arc<dyn AudioDeviceProvider>,
    status: Arc<dyn StatusSink>,
    network: NetworkConfig,
    active: Mutex<Option<ActiveSession>>,
    state: Arc<watch::Sender<SessionState>>,
    discovery: parking_lot::Mutex<Option<DiscoveryTask>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn AudioDeviceProvider>,
        status: Arc<dyn StatusSink>,
        network: NetworkConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(SessionState::Idle);
        Self {
            provider,
            status,
            network,
            active: Mutex::new(None),
            state: Arc::new(state),
            discovery: parking_lot::Mutex::new(None),
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Handle of the live session, if any
    pub async fn active_session(&self) -> Option<SessionHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|session| !session.is_finished())
            .map(|session| session.handle)
    }

    /// Start capturing and streaming.
    ///
    /// A unicast server waits for one client hello before it sends audio; a
    /// multicast server streams to the group immediately.
    pub async fn start_server(&self, opts: ServerOptions) -> Result<SessionHandle> {
        let mut active = self.active.lock().await;
        Self::reap(&mut active).await?;

        let resources = match self.prepare_server(&opts).await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!("Server failed to start: {}", e);
                self.status.notify(error_event(&e, SessionRole::Server));
                self.status.notify(StatusEvent::new(StatusKey::ServerStopped));
                return Err(e);
            }
        };

        let handle = SessionHandle::new();
        let ctx = self.context(StopSignal::new());
        let paired = StopSignal::new();
        let mut helpers = Vec::new();

        if self.network.announce {
            let announcement = Announcement::new(local_hostname(), opts.mode, opts.port);
            let target = SocketAddrV4::new(self.network.multicast_group, self.network.discovery_port);
            let beacon = run_beacon(
                announcement,
                target,
                self.network.announce_interval(),
                ctx.stop.clone(),
                paired.clone(),
            );
            helpers.push(tokio::spawn(async move {
                if let Err(e) = beacon.await {
                    tracing::warn!("Beacon failed: {}", e);
                }
            }));
        }

        helpers.extend(spawn_mic_receiver(
            self.provider.clone(),
            self.status.clone(),
            opts.format,
            opts.mic_playback_device.clone(),
            opts.mode,
            self.network.multicast_group,
            opts.mic_port,
            ctx.stop.clone(),
        ));

        let group_dest = match opts.mode {
            TransportMode::Multicast => {
                let dest = SocketAddr::new(IpAddr::V4(self.network.multicast_group), opts.port);
                ctx.set_state(SessionState::Streaming);
                ctx.notify(StatusEvent::new(StatusKey::MulticastStreaming).with_arg(dest));
                Some(dest)
            }
            TransportMode::Unicast => {
                ctx.set_state(SessionState::Announcing);
                ctx.notify(StatusEvent::new(StatusKey::ServerWaiting).with_arg(opts.port));
                None
            }
        };

        tracing::info!("Server session {} started ({}, port {})", handle, opts.mode, opts.port);
        let main = tokio::spawn(run_server(ctx.clone(), resources, group_dest, paired));

        *active = Some(ActiveSession {
            handle,
            role: SessionRole::Server,
            stop: ctx.stop,
            main,
            helpers,
        });
        Ok(handle)
    }

    /// Connect to `opts.peer` and play its stream.
    ///
    /// Unicast peers are handshaken first; multicast peers are joined
    /// directly. Any running discovery listener is stopped.
    pub async fn start_client(&self, opts: ClientOptions) -> Result<SessionHandle> {
        let mut active = self.active.lock().await;
        Self::reap(&mut active).await?;
        self.stop_discovery().await;

        let resources = match self.prepare_client(&opts).await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!("Client failed to start: {}", e);
                self.status.notify(error_event(&e, SessionRole::Client));
                self.status.notify(StatusEvent::new(StatusKey::StreamingEnded));
                return Err(e);
            }
        };

        let handle = SessionHandle::new();
        let ctx = self.context(StopSignal::new());
        let server = SocketAddr::new(opts.peer.addr, opts.peer.port);
        let group = IpAddr::V4(self.network.multicast_group);

        let mic_dest = if opts.peer.mode.is_multicast() {
            SocketAddr::new(group, opts.mic_port)
        } else {
            SocketAddr::new(opts.peer.addr, opts.mic_port)
        };
        let mic = MicRoute {
            provider: self.provider.clone(),
            format: opts.format,
            device: opts.mic_capture_device.clone().filter(|_| opts.send_mic),
            dest: mic_dest,
        };

        let handshake = match opts.peer.mode {
            TransportMode::Multicast => {
                ctx.set_state(SessionState::Streaming);
                ctx.notify(
                    StatusEvent::new(StatusKey::JoiningMulticast)
                        .with_arg(SocketAddr::new(group, opts.peer.port)),
                );
                None
            }
            TransportMode::Unicast => {
                ctx.set_state(SessionState::Handshaking);
                ctx.notify(StatusEvent::new(StatusKey::ContactingServer).with_arg(server));
                Some((self.network.handshake_timeout(), self.network.hello_resend()))
            }
        };

        tracing::info!("Client session {} started ({} from {})", handle, opts.peer.mode, server);
        let main = tokio::spawn(run_client(
            ctx.clone(),
            resources,
            server,
            handshake,
            opts.format.receive_buffer_size(),
            mic,
        ));

        *active = Some(ActiveSession {
            handle,
            role: SessionRole::Client,
            stop: ctx.stop,
            main,
            helpers: Vec::new(),
        });
        Ok(handle)
    }

    /// Stop the session behind `handle` and wait for its teardown.
    ///
    /// Unknown or already stopped handles are ignored.
    pub async fn stop(&self, handle: SessionHandle) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|session| session.handle) != Some(handle) {
            return;
        }
        if let Some(session) = active.take() {
            self.state.send_replace(SessionState::Stopping);
            session.shutdown().await;
            self.settle();
        }
    }

    /// Stop whatever session is live
    pub async fn stop_current(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            self.state.send_replace(SessionState::Stopping);
            session.shutdown().await;
            self.settle();
        }
    }

    /// Stop discovery and any live session
    pub async fn shutdown(&self) {
        self.stop_discovery().await;
        self.stop_current().await;
        tracing::info!("Session manager shut down");
    }

    /// Listen for server beacons, calling `on_peer` for each one heard.
    ///
    /// Does nothing while a listener is already running.
    pub fn start_discovery<F>(&self, on_peer: F)
    where
        F: Fn(String, PeerDescriptor) + Send + Sync + 'static,
    {
        let mut discovery = self.discovery.lock();
        if discovery.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return;
        }

        let stop = StopSignal::new();
        let listener = run_listener(
            self.network.multicast_group,
            self.network.discovery_port,
            self.network.discovery_timeout(),
            stop.clone(),
            on_peer,
        );
        let status = self.status.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = listener.await {
                tracing::error!("Discovery failed: {}", e);
                status.notify(StatusEvent::new(StatusKey::DiscoveryError).with_arg(e.to_string()));
            }
        });

        *discovery = Some(DiscoveryTask { stop, task });
        self.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Discovering;
                true
            } else {
                false
            }
        });
    }

    /// Stop the discovery listener and wait for it to close its socket
    pub async fn stop_discovery(&self) {
        let discovery = self.discovery.lock().take();
        if let Some(DiscoveryTask { stop, task }) = discovery {
            stop.trigger();
            if let Err(e) = task.await {
                tracing::error!("Discovery task failed: {}", e);
            }
        }
        self.state.send_if_modified(|state| {
            if *state == SessionState::Discovering {
                *state = SessionState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Restart discovery with a fresh listener
    pub async fn refresh_discovery<F>(&self, on_peer: F)
    where
        F: Fn(String, PeerDescriptor) + Send + Sync + 'static,
    {
        self.stop_discovery().await;
        self.start_discovery(on_peer);
    }

    fn context(&self, stop: StopSignal) -> TaskContext {
        TaskContext {
            status: self.status.clone(),
            state: self.state.clone(),
            stop,
        }
    }

    /// Clear a session that ended on its own; refuse if one is still live
    async fn reap(active: &mut Option<ActiveSession>) -> Result<()> {
        match active.as_ref() {
            Some(session) if !session.is_finished() => {
                Err(SessionError::Busy(session.handle).into())
            }
            Some(_) => {
                if let Some(session) = active.take() {
                    session.shutdown().await;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Idle again, unless discovery is still listening
    fn settle(&self) {
        let discovering = self
            .discovery
            .lock()
            .as_ref()
            .is_some_and(|d| !d.task.is_finished());
        self.state.send_replace(if discovering {
            SessionState::Discovering
        } else {
            SessionState::Idle
        });
    }

    async fn prepare_server(&self, opts: &ServerOptions) -> Result<ServerResources> {
        self.network.validate()?;
        let device = opts.capture_device.clone().ok_or(ConfigError::NoDevice)?;
        opts.format.validate()?;
        let read_size = opts.format.adjusted_buffer_size()?;
        validate_port(opts.port)?;
        validate_port(opts.mic_port)?;

        let socket = match opts.mode {
            TransportMode::Unicast => bind_reusable(opts.port)?,
            TransportMode::Multicast => multicast_sender()?,
        };

        let provider = self.provider.clone();
        let format = opts.format;
        let line =
            open_line(move || provider.open_capture(&device, &format, read_size)).await?;

        Ok(ServerResources {
            line,
            socket,
            read_size,
        })
    }

    async fn prepare_client(&self, opts: &ClientOptions) -> Result<ClientResources> {
        self.network.validate()?;
        let device = opts.playback_device.clone().ok_or(ConfigError::NoDevice)?;
        opts.format.validate()?;
        let buffer_bytes = opts.format.adjusted_buffer_size()?;
        validate_port(opts.peer.port)?;
        validate_port(opts.mic_port)?;

        let endpoint = match opts.peer.mode {
            TransportMode::Unicast => Endpoint::unicast(bind_ephemeral()?),
            TransportMode::Multicast => {
                let group = self.network.multicast_group;
                Endpoint::multicast(bind_multicast(group, opts.peer.port)?, group)
            }
        };

        let provider = self.provider.clone();
        let format = opts.format;
        let line = match open_line(move || provider.open_playback(&device, &format, buffer_bytes)).await {
            Ok(line) => line,
            Err(e) => {
                endpoint.close();
                return Err(e.into());
            }
        };

        Ok(ClientResources { line, endpoint })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Tasks finish their own teardown once signalled
        if let Some(session) = self.active.get_mut() {
            session.stop.trigger();
        }
        if let Some(discovery) = self.discovery.get_mut() {
            discovery.stop.trigger();
        }
    }
}

/// Server main task: pair (unicast only), stream, then report the end
async fn run_server(
    ctx: TaskContext,
    resources: ServerResources,
    group_dest: Option<SocketAddr>,
    paired: StopSignal,
) {
    let ServerResources {
        line,
        socket,
        read_size,
    } = resources;

    let result = match group_dest {
        Some(dest) => capture::run(line, Endpoint::unicast(socket), dest, read_size, &ctx.stop).await,
        None => serve_client(&ctx, line, socket, read_size, &paired).await,
    };

    match &result {
        Ok(PipelineEnd::EndOfStream) => tracing::info!("Capture line ended"),
        Ok(PipelineEnd::Stopped) => {}
        Err(e) => {
            tracing::error!("Server session failed: {}", e);
            ctx.notify(error_event(e, SessionRole::Server));
        }
    }

    paired.trigger();
    ctx.stop.trigger();
    ctx.set_state(SessionState::Idle);
    ctx.notify(StatusEvent::new(StatusKey::ServerStopped));
}

async fn serve_client(
    ctx: &TaskContext,
    line: Box<dyn CaptureLine>,
    socket: UdpSocket,
    read_size: usize,
    paired: &StopSignal,
) -> Result<PipelineEnd> {
    match accept_client(&socket, &ctx.stop).await {
        Ok(HandshakeOutcome::Paired(client)) => {
            paired.trigger();
            ctx.notify(StatusEvent::new(StatusKey::ClientConnected).with_arg(client));
            ctx.set_state(SessionState::Streaming);
            capture::run(line, Endpoint::unicast(socket), client, read_size, &ctx.stop).await
        }
        Ok(HandshakeOutcome::Cancelled) => {
            capture::release(capture::share(line)).await;
            Ok(PipelineEnd::Stopped)
        }
        Err(e) => {
            capture::release(capture::share(line)).await;
            Err(e)
        }
    }
}

/// Client main task: handshake (unicast only), play, then report the end
async fn run_client(
    ctx: TaskContext,
    resources: ClientResources,
    server: SocketAddr,
    handshake: Option<(Duration, Duration)>,
    recv_size: usize,
    mic: MicRoute,
) {
    let ClientResources { line, endpoint } = resources;

    let outcome = match handshake {
        Some((timeout, resend)) => {
            ctx.notify(StatusEvent::new(StatusKey::WaitingAck).with_arg(server));
            let outcome = connect_to_server(endpoint.socket(), server, timeout, resend, &ctx.stop).await;
            if let Ok(HandshakeOutcome::Paired(_)) = outcome {
                ctx.notify(StatusEvent::new(StatusKey::ConnectedStreamingFrom).with_arg(server));
                ctx.set_state(SessionState::Streaming);
            }
            outcome
        }
        None => Ok(HandshakeOutcome::Paired(server)),
    };

    let mut mic_task = None;
    let result = match outcome {
        Ok(HandshakeOutcome::Paired(_)) => {
            mic_task = spawn_mic_sender(
                mic.provider,
                ctx.status.clone(),
                mic.format,
                mic.device,
                mic.dest,
                ctx.stop.clone(),
            );
            playback::run(line, endpoint, recv_size, &ctx.stop).await
        }
        Ok(HandshakeOutcome::Cancelled) => {
            playback::release(playback::share(line)).await;
            endpoint.close();
            Ok(PipelineEnd::Stopped)
        }
        Err(e) => {
            playback::release(playback::share(line)).await;
            endpoint.close();
            Err(e)
        }
    };

    if let Err(e) = &result {
        tracing::error!("Client session failed: {}", e);
        let event = match e {
            Error::Protocol(ProtocolError::Timeout(_)) => {
                StatusEvent::new(StatusKey::ServerNoResponse).with_arg(server)
            }
            _ => error_event(e, SessionRole::Client),
        };
        ctx.notify(event);
    }

    ctx.stop.trigger();
    if let Some(task) = mic_task {
        if let Err(e) = task.await {
            tracing::error!("Mic sender task failed: {}", e);
        }
    }
    ctx.set_state(SessionState::Idle);
    ctx.notify(StatusEvent::new(StatusKey::StreamingEnded));
}

/// Map a failure to the event the user sees
fn error_event(error: &Error, role: SessionRole) -> StatusEvent {
    let key = match error {
        Error::Config(ConfigError::NoDevice) | Error::Audio(AudioError::DeviceNotFound(_)) => {
            StatusKey::ErrorNoDevice
        }
        Error::Config(ConfigError::UnsupportedFormat(_))
        | Error::Audio(AudioError::UnsupportedFormat(_)) => StatusKey::ErrorUnsupportedFormat,
        Error::Config(ConfigError::InvalidBuffer { .. } | ConfigError::BufferOutOfRange(_)) => {
            StatusKey::ErrorInvalidBuffer
        }
        Error::Config(ConfigError::InvalidPort(port)) => {
            return StatusEvent::new(StatusKey::ErrorInvalidPort).with_arg(*port);
        }
        Error::Audio(_) => StatusKey::ErrorCriticalLine,
        Error::Protocol(ProtocolError::Timeout(_)) => StatusKey::ServerNoResponse,
        Error::Protocol(ProtocolError::UnexpectedPayload { .. }) => StatusKey::HandshakeFailed,
        _ => match role {
            SessionRole::Server => StatusKey::ErrorServer,
            SessionRole::Client => StatusKey::ErrorClient,
        },
    };
    StatusEvent::new(key).with_arg(error.to_string())
}
