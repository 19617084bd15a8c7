//! Scripted in-memory [`Socket`] used to drive the engine in tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::socket::{ConnectProgress, IpVersion, ReceiveOutcome, Socket, SocketFactory};
use crate::config::{DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_SLEEP_TIME};

/// Number of calls made to each operation of a [`MockSocket`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Calls {
    pub(crate) listen: usize,
    pub(crate) connect: usize,
    pub(crate) accept: usize,
    pub(crate) receive: usize,
    pub(crate) send: usize,
    pub(crate) close: usize,
}

impl Calls {
    pub(crate) fn total(&self) -> usize {
        self.listen + self.connect + self.accept + self.receive + self.send + self.close
    }
}

#[derive(Debug)]
struct State {
    listen_results: VecDeque<io::Result<()>>,
    connect_results: VecDeque<io::Result<ConnectProgress>>,
    connect_default: ConnectProgress,
    accepts: VecDeque<io::Result<MockSocket>>,
    receives: VecDeque<ReceiveOutcome>,
    send_results: VecDeque<io::Result<usize>>,
    sent: Vec<Vec<u8>>,
    calls: Calls,
    listen_port: u16,
    listening: bool,
    connected: bool,
    peer_ip: String,
    peer_port: u16,
    peer_name: String,
    last_errno: i32,
    receive_buffer_size: usize,
    sleep_time: Duration,
}

/// Test double for [`Socket`].
///
/// Clones share their state, so a test keeps one clone to script results and
/// inspect calls while the engine owns another. Unscripted operations succeed:
/// listen and connect succeed immediately, accept finds nothing, receive finds
/// nothing, send writes everything.
#[derive(Debug, Clone)]
pub(crate) struct MockSocket {
    state: Arc<Mutex<State>>,
}

impl MockSocket {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                listen_results: VecDeque::new(),
                connect_results: VecDeque::new(),
                connect_default: ConnectProgress::Connected,
                accepts: VecDeque::new(),
                receives: VecDeque::new(),
                send_results: VecDeque::new(),
                sent: Vec::new(),
                calls: Calls::default(),
                listen_port: 0,
                listening: false,
                connected: false,
                peer_ip: "127.0.0.1".to_string(),
                peer_port: 0,
                peer_name: "localhost".to_string(),
                last_errno: 0,
                receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
                sleep_time: DEFAULT_SLEEP_TIME,
            })),
        }
    }

    /// A socket that reports itself as connected to `ip:port`, as returned by
    /// an accept.
    pub(crate) fn connected(ip: &str, port: u16) -> Self {
        let sock = Self::new();
        {
            let mut state = sock.state.lock();
            state.connected = true;
            state.peer_ip = ip.to_string();
            state.peer_port = port;
        }
        sock
    }

    pub(crate) fn push_listen(&self, result: io::Result<()>) {
        self.state.lock().listen_results.push_back(result);
    }

    pub(crate) fn push_connect(&self, result: io::Result<ConnectProgress>) {
        self.state.lock().connect_results.push_back(result);
    }

    /// Makes every unscripted connect report [`ConnectProgress::InProgress`].
    pub(crate) fn stall_connect(&self) {
        self.state.lock().connect_default = ConnectProgress::InProgress;
    }

    pub(crate) fn push_accept(&self, result: io::Result<MockSocket>) {
        self.state.lock().accepts.push_back(result);
    }

    pub(crate) fn push_receive(&self, outcome: ReceiveOutcome) {
        self.state.lock().receives.push_back(outcome);
    }

    pub(crate) fn push_send(&self, result: io::Result<usize>) {
        self.state.lock().send_results.push_back(result);
    }

    pub(crate) fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    /// A factory handing out `sockets` in order, then fresh default sockets.
    pub(crate) fn factory(sockets: Vec<MockSocket>) -> SocketFactory {
        let queue = Mutex::new(VecDeque::from(sockets));

        Arc::new(move || -> Box<dyn Socket> {
            let sock = queue.lock().pop_front().unwrap_or_else(MockSocket::new);
            Box::new(sock)
        })
    }
}

impl Socket for MockSocket {
    fn listen(&mut self, port: u16, _version: IpVersion) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.listen += 1;

        let result = match state.listen_results.pop_front() {
            Some(result) => result,
            None if port == 0 => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            None => Ok(()),
        };
        match &result {
            Ok(()) => {
                state.listening = true;
                state.listen_port = port;
            }
            Err(err) => state.last_errno = err.raw_os_error().unwrap_or(0),
        }
        result
    }

    fn connect(&mut self, ip: &str, port: u16) -> io::Result<ConnectProgress> {
        let mut state = self.state.lock();
        state.calls.connect += 1;

        let fallback = state.connect_default;
        let result = state.connect_results.pop_front().unwrap_or(Ok(fallback));
        match &result {
            Ok(ConnectProgress::Connected) => {
                state.connected = true;
                state.peer_ip = ip.to_string();
                state.peer_port = port;
            }
            Ok(ConnectProgress::InProgress) => {}
            Err(err) => state.last_errno = err.raw_os_error().unwrap_or(0),
        }
        result
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.calls.close += 1;
        state.listening = false;
        state.connected = false;
        state.listen_port = 0;
    }

    fn accept(&mut self) -> io::Result<Option<Box<dyn Socket>>> {
        let mut state = self.state.lock();
        state.calls.accept += 1;

        match state.accepts.pop_front() {
            Some(Ok(sock)) => Ok(Some(Box::new(sock))),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    fn receive(&mut self) -> ReceiveOutcome {
        let mut state = self.state.lock();
        state.calls.receive += 1;

        state
            .receives
            .pop_front()
            .unwrap_or(ReceiveOutcome::NothingAvailable)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.calls.send += 1;

        let result = state.send_results.pop_front().unwrap_or(Ok(data.len()));
        if let Ok(n) = &result {
            let n = (*n).min(data.len());
            state.sent.push(data[..n].to_vec());
        }
        result
    }

    fn is_listener(&self) -> bool {
        self.state.lock().listen_port != 0
    }

    fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn listen_port(&self) -> u16 {
        self.state.lock().listen_port
    }

    fn peer_ip_address(&self) -> String {
        self.state.lock().peer_ip.clone()
    }

    fn peer_port(&self) -> u16 {
        self.state.lock().peer_port
    }

    fn peer_name(&self) -> String {
        self.state.lock().peer_name.clone()
    }

    fn own_ip_address(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn last_errno(&self) -> i32 {
        self.state.lock().last_errno
    }

    fn set_receive_buffer_size(&mut self, size: usize) {
        self.state.lock().receive_buffer_size = size;
    }

    fn receive_buffer_size(&self) -> usize {
        self.state.lock().receive_buffer_size
    }

    fn set_sleep_time(&mut self, sleep: Duration) {
        self.state.lock().sleep_time = sleep;
    }

    fn sleep_time(&self) -> Duration {
        self.state.lock().sleep_time
    }
}
