//! The connection engine and its three background workers.
//!
//! User calls only enqueue work and wake the matching worker. Workers mutate
//! the shared state under the data lock, release it, and only then report
//! through the registered callbacks.

mod connect;
mod listen;
mod send;


use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::callback::{Callbacks, Event, EventKind};
use crate::config::{Config, Settings};
use crate::error::{Message, Result};
use crate::net::{IpVersion, Socket, SocketFactory, TcpSocket};
use crate::peer::{DisconnectReason, Peer, PeerId};
use crate::registry::PeerRegistry;

/// Lifecycle of the listening socket, driven by the listen worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenState {
    Disabled,
    /// Bind requested; the listener is closed.
    Enabling,
    Listening,
    /// Re-bind requested while the listener is open.
    Reconfiguring,
    /// Close requested while the listener is open.
    Disabling,
}

/// Everything guarded by the data lock.
#[derive(Debug)]
struct State {
    registry: PeerRegistry,
    dial_queue: VecDeque<(String, u16)>,
    send_queue: VecDeque<(PeerId, Vec<u8>)>,
    listener: Box<dyn Socket>,
    listen_state: ListenState,
    listen_port: u16,
    ip_version: IpVersion,
    shutdown: bool,
}

impl State {
    /// Whether the listen worker has anything to poll or a transition to make.
    fn has_listen_work(&self) -> bool {
        !self.registry.is_empty() || self.listen_state != ListenState::Disabled
    }
}

struct Shared {
    state: Mutex<State>,
    callbacks: Callbacks,
    /// Wakes the listen worker: new peer, listener request, disconnect.
    listen_wakeup: Condvar,
    dial_ready: Condvar,
    send_ready: Condvar,
    settings: Settings,
    factory: SocketFactory,
}

impl Shared {
    /// Creates a socket for a new connection or listener, configured with the
    /// current settings.
    fn new_socket(&self) -> Box<dyn Socket> {
        let mut socket = (self.factory)();
        self.configure(socket.as_mut());
        socket
    }

    fn configure(&self, socket: &mut dyn Socket) {
        socket.set_receive_buffer_size(self.settings.receive_buffer_size());
        socket.set_sleep_time(self.settings.sleep_time());
    }

    fn dispatch(&self, event: &Event) {
        self.callbacks.dispatch(event);
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("callbacks", &self.callbacks)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Workers {
    connect: Option<JoinHandle<()>>,
    send: Option<JoinHandle<()>>,
    listen: Option<JoinHandle<()>>,
}

/// Callback-driven engine managing many TCP connections at once.
///
/// Every action returns immediately; outcomes are reported through the
/// `on_*` callbacks from one of three background threads (connect, send and
/// listen/receive), started on first use and joined when the node is dropped.
/// Callbacks are never invoked while internal locks are held, so a callback
/// may call back into the node.
///
/// ```no_run
/// use tcpnode::{IpVersion, TcpNode};
///
/// let node = TcpNode::new();
/// node.on_receive(|peer, data| println!("[{peer}] {} bytes", data.len()));
/// node.on_accept(|peer| println!("[{peer}] accepted"));
/// node.start_listening(4200, IpVersion::Any);
/// ```
#[derive(Debug)]
pub struct TcpNode {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
}

impl TcpNode {
    /// Creates a node with the default [`Config`] over [`TcpSocket`]s.
    pub fn new() -> Self {
        Self::build(&Config::default(), Arc::new(TcpSocket::boxed))
    }

    /// Creates a node with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(&config, Arc::new(TcpSocket::boxed)))
    }

    /// Creates a node whose connections and listener come from `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn with_socket_factory<F>(config: Config, factory: F) -> Result<Self>
    where
        F: Fn() -> Box<dyn Socket> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::build(&config, Arc::new(factory)))
    }

    fn build(config: &Config, factory: SocketFactory) -> Self {
        let settings = Settings::new(config);
        let mut listener = factory();
        listener.set_receive_buffer_size(settings.receive_buffer_size());
        listener.set_sleep_time(settings.sleep_time());

        let state = State {
            registry: PeerRegistry::new(),
            dial_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            listener,
            listen_state: ListenState::Disabled,
            listen_port: 0,
            ip_version: IpVersion::Any,
            shutdown: false,
        };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                callbacks: Callbacks::new(),
                listen_wakeup: Condvar::new(),
                dial_ready: Condvar::new(),
                send_ready: Condvar::new(),
                settings,
                factory,
            }),
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Starts any worker thread that is not running yet.
    fn ensure_workers(&self) {
        let mut guard = self.workers.lock();
        let workers = &mut *guard;

        for (name, slot, run) in [
            ("connect", &mut workers.connect, connect::run as fn(Arc<Shared>)),
            ("send", &mut workers.send, send::run),
            ("listen", &mut workers.listen, listen::run),
        ] {
            if slot.is_some() {
                continue;
            }

            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name(format!("tcpnode-{name}"))
                .spawn(move || run(shared))
            {
                Ok(handle) => *slot = Some(handle),
                Err(err) => error!("failed to spawn {name} worker: {err}"),
            }
        }
    }

    fn wake_listener(&self) {
        self.shared.listen_wakeup.notify_one();
    }

    // Callbacks.

    fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.callbacks.set(kind, Arc::new(handler));
    }

    /// Called with the effective port once the listener is accepting.
    pub fn on_started_listening<F>(&self, f: F)
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        self.register(EventKind::StartedListening, move |event| {
            if let Event::StartedListening(port) = event {
                f(*port);
            }
        });
    }

    /// Called once the listener has been closed by [`TcpNode::stop_listening`].
    pub fn on_stopped_listening<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(EventKind::StoppedListening, move |event| {
            if let Event::StoppedListening = event {
                f();
            }
        });
    }

    /// Called for every inbound connection.
    pub fn on_accept<F>(&self, f: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.register(EventKind::Accepted, move |event| {
            if let Event::Accepted(peer) = event {
                f(peer);
            }
        });
    }

    /// Called with the bytes read from a peer.
    pub fn on_receive<F>(&self, f: F)
    where
        F: Fn(&Peer, &[u8]) + Send + Sync + 'static,
    {
        self.register(EventKind::Received, move |event| {
            if let Event::Received(peer, data) = event {
                f(peer, data);
            }
        });
    }

    /// Called when the remote end closed a connection.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.register(EventKind::Disconnected, move |event| {
            if let Event::Disconnected(peer) = event {
                f(peer);
            }
        });
    }

    /// Called when a connection closed on local request has been removed.
    pub fn on_closed_connection<F>(&self, f: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.register(EventKind::Closed, move |event| {
            if let Event::Closed(peer) = event {
                f(peer);
            }
        });
    }

    /// Called for every outbound connection established by
    /// [`TcpNode::connect_to`].
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.register(EventKind::Connected, move |event| {
            if let Event::Connected(peer) = event {
                f(peer);
            }
        });
    }

    /// Called with the number of bytes written for a send request.
    pub fn on_send<F>(&self, f: F)
    where
        F: Fn(&Peer, usize) + Send + Sync + 'static,
    {
        self.register(EventKind::Sent, move |event| {
            if let Event::Sent(peer, len) = event {
                f(peer, *len);
            }
        });
    }

    /// Called when a connection closed because of an error has been removed.
    pub fn on_faulty_connection_closed<F>(&self, f: F)
    where
        F: Fn(&Peer, &Message) + Send + Sync + 'static,
    {
        self.register(EventKind::FaultyConnectionClosed, move |event| {
            if let Event::FaultyConnectionClosed(peer, message) = event {
                f(peer, message);
            }
        });
    }

    /// Called when the listener cannot be created or an accept fails.
    pub fn on_listen_error<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(EventKind::ListenError, move |event| {
            if let Event::ListenError(message) = event {
                f(message);
            }
        });
    }

    /// Called when a send request fails.
    pub fn on_send_error<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(EventKind::SendError, move |event| {
            if let Event::SendError(message) = event {
                f(message);
            }
        });
    }

    /// Called when an outbound connection fails or times out.
    pub fn on_connect_error<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(EventKind::ConnectError, move |event| {
            if let Event::ConnectError(message) = event {
                f(message);
            }
        });
    }

    // Actions.

    /// Requests a listener on `port`. Calling it again while listening
    /// re-binds with the new parameters.
    pub fn start_listening(&self, port: u16, ip_version: IpVersion) {
        {
            let mut state = self.shared.state.lock();
            state.listen_port = port;
            state.ip_version = ip_version;
            state.listen_state = match state.listen_state {
                ListenState::Disabled | ListenState::Enabling => ListenState::Enabling,
                ListenState::Listening | ListenState::Reconfiguring | ListenState::Disabling => {
                    ListenState::Reconfiguring
                }
            };
            debug!("listen requested on port {port} ({ip_version:?})");
        }

        self.ensure_workers();
        self.wake_listener();
    }

    /// Requests the listener to be closed. Established connections stay open.
    pub fn stop_listening(&self) {
        {
            let mut state = self.shared.state.lock();
            state.listen_state = match state.listen_state {
                ListenState::Enabling => ListenState::Disabled,
                ListenState::Listening | ListenState::Reconfiguring => ListenState::Disabling,
                unchanged @ (ListenState::Disabled | ListenState::Disabling) => unchanged,
            };
        }

        self.wake_listener();
    }

    /// Queues a dial to `ip:port`. Requests are processed in order and never
    /// retried.
    pub fn connect_to(&self, ip: impl Into<String>, port: u16) {
        self.shared
            .state
            .lock()
            .dial_queue
            .push_back((ip.into(), port));

        self.ensure_workers();
        self.shared.dial_ready.notify_one();
    }

    /// Queues `data` to be written to `peer`.
    pub fn send(&self, peer: &Peer, data: impl Into<Vec<u8>>) {
        self.send_to(peer.id(), data);
    }

    /// Queues `data` to be written to the peer with connection id `id`.
    pub fn send_to(&self, id: PeerId, data: impl Into<Vec<u8>>) {
        self.shared
            .state
            .lock()
            .send_queue
            .push_back((id, data.into()));

        self.ensure_workers();
        self.shared.send_ready.notify_one();
    }

    /// Schedules `peer` to be closed. The closed-connection callback follows
    /// once it has been removed.
    pub fn disconnect(&self, peer: &Peer) {
        self.disconnect_id(peer.id());
    }

    /// See [`TcpNode::disconnect`].
    pub fn disconnect_id(&self, id: PeerId) {
        let marked = self.shared.state.lock().registry.mark_pending_deletion(
            id,
            DisconnectReason::ClosedByLocalRequest,
            None,
        );

        if marked {
            self.wake_listener();
        }
    }

    /// Schedules every peer to be closed.
    pub fn disconnect_all(&self) {
        let marked = self
            .shared
            .state
            .lock()
            .registry
            .mark_all_pending(DisconnectReason::ClosedByLocalRequest);

        if marked > 0 {
            debug!("disconnecting {marked} peers");
            self.wake_listener();
        }
    }

    // Queries.

    /// Whether the listener is accepting connections.
    pub fn is_listening(&self) -> bool {
        matches!(
            self.shared.state.lock().listen_state,
            ListenState::Listening | ListenState::Reconfiguring
        )
    }

    /// Port of the active listener, `0` if not listening.
    pub fn listen_port(&self) -> u16 {
        self.shared.state.lock().listener.listen_port()
    }

    /// Copy of every connection, keyed by id. Includes peers scheduled for
    /// removal that have not been removed yet.
    pub fn all_peers(&self) -> HashMap<PeerId, Peer> {
        self.shared.state.lock().registry.snapshot()
    }

    /// The most recently established connection.
    pub fn latest_peer(&self) -> Option<Peer> {
        self.shared.state.lock().registry.latest().cloned()
    }

    /// The connection with id `id`.
    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        self.shared.state.lock().registry.find(id).cloned()
    }

    /// The newest connection to or from `ip:port`.
    pub fn peer_by_address(&self, ip: &str, port: u16) -> Option<Peer> {
        self.shared
            .state
            .lock()
            .registry
            .find_by_address(ip, port)
            .cloned()
    }

    /// Maximum number of bytes delivered per receive callback.
    pub fn receive_buffer_size(&self) -> usize {
        self.shared.settings.receive_buffer_size()
    }

    /// How long an outbound connection may take.
    pub fn connect_timeout(&self) -> Duration {
        self.shared.settings.connect_timeout()
    }

    /// Polling interval of the workers.
    pub fn sleep_time(&self) -> Duration {
        self.shared.settings.sleep_time()
    }

    // Runtime configuration.

    /// Applies to new connections and to every established one.
    pub fn set_receive_buffer_size(&self, size: usize) {
        self.shared.settings.set_receive_buffer_size(size);

        let size = self.shared.settings.receive_buffer_size();
        let mut state = self.shared.state.lock();
        state.listener.set_receive_buffer_size(size);
        state.registry.set_receive_buffer_size(size);
    }

    /// Applies to dials started after the call.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.shared.settings.set_connect_timeout(timeout);
    }

    /// Applies from the next worker iteration on.
    pub fn set_sleep_time(&self, sleep: Duration) {
        self.shared.settings.set_sleep_time(sleep);

        let sleep = self.shared.settings.sleep_time();
        self.shared.state.lock().listener.set_sleep_time(sleep);
    }

    /// Replaces the listening socket. If a listener is active, the new one is
    /// bound with the current port and IP version.
    pub fn set_listener(&self, mut listener: Box<dyn Socket>) {
        self.shared.configure(listener.as_mut());

        {
            let mut state = self.shared.state.lock();
            let mut previous = std::mem::replace(&mut state.listener, listener);
            previous.close();

            // A pending stop stays pending: the worker closes the new socket
            // and reports stopped-listening.
            if matches!(
                state.listen_state,
                ListenState::Listening | ListenState::Reconfiguring
            ) {
                state.listen_state = ListenState::Reconfiguring;
            }
        }

        self.wake_listener();
    }
}

impl Default for TcpNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpNode {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.listen_wakeup.notify_all();
        self.shared.dial_ready.notify_all();
        self.shared.send_ready.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (name, handle) in [
            ("connect", workers.connect),
            ("send", workers.send),
            ("listen", workers.listen),
        ] {
            let Some(handle) = handle else {
                continue;
            };
            if handle.thread().id() == thread::current().id() {
                debug!("{name} worker dropped its own node, not joining");
                continue;
            }
            if handle.join().is_err() {
                debug!("{name} worker panicked");
            }
        }

        let mut state = self.shared.state.lock();
        let closed = state.registry.drain();
        state.listener.close();
        state.dial_queue.clear();
        state.send_queue.clear();

        info!("node shut down, closed {closed} connections");
    }
}
