//! Connect worker: turns queued dial requests into peers.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::Shared;
use crate::callback::Event;
use crate::error::{Error, Message};
use crate::net::{ConnectProgress, Socket};

enum Dial {
    Established,
    Failed(Error),
    /// The node is shutting down.
    Aborted,
}

pub(super) fn run(shared: Arc<Shared>) {
    debug!("connect worker started");

    loop {
        let (ip, port) = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    debug!("connect worker stopped");
                    return;
                }
                if let Some(request) = state.dial_queue.pop_front() {
                    break request;
                }
                shared.dial_ready.wait(&mut state);
            }
        };

        dial(&shared, &ip, port);
    }
}

fn target(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

fn dial(shared: &Shared, ip: &str, port: u16) {
    let target = target(ip, port);
    let mut socket = shared.new_socket();

    debug!("[{target}] connecting");
    match establish(shared, socket.as_mut(), ip, port, &target) {
        Dial::Established => {}
        Dial::Failed(err) => {
            socket.close();
            warn!("[{target}] {err}");
            shared.dispatch(&Event::ConnectError(Message::from(&err)));
            return;
        }
        Dial::Aborted => {
            socket.close();
            return;
        }
    }

    let mut ip_address = socket.peer_ip_address();
    if ip_address.is_empty() {
        ip_address = ip.to_string();
    }
    let host_name = socket.peer_name();

    let peer = {
        let mut state = shared.state.lock();
        if state.shutdown {
            socket.close();
            return;
        }

        let peer = state.registry.insert(ip_address, port, host_name, socket);
        state.registry.pin(peer.id());
        peer
    };
    shared.listen_wakeup.notify_one();

    info!("[{peer}] connected");
    shared.dispatch(&Event::Connected(peer.clone()));

    shared.state.lock().registry.unpin(peer.id());
}

/// Drives `socket` until it connects, fails, or the connect timeout elapses.
/// The timeout is measured from the first attempt.
fn establish(
    shared: &Shared,
    socket: &mut dyn Socket,
    ip: &str,
    port: u16,
    target: &str,
) -> Dial {
    let started = Instant::now();

    loop {
        match socket.connect(ip, port) {
            Ok(ConnectProgress::Connected) => return Dial::Established,
            Ok(ConnectProgress::InProgress) => {}
            Err(source) => {
                return Dial::Failed(Error::Connect {
                    target: target.to_string(),
                    source,
                });
            }
        }

        thread::sleep(shared.settings.sleep_time());

        let elapsed = started.elapsed();
        if elapsed >= shared.settings.connect_timeout() {
            return Dial::Failed(Error::ConnectTimeout {
                target: target.to_string(),
                elapsed,
            });
        }
        if shared.state.lock().shutdown {
            return Dial::Aborted;
        }
    }
}
