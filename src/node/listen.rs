//! Listen worker: listener lifecycle, accepting, receiving and removal of
//! peers scheduled for deletion.
//!
//! This is the only thread that removes peers from the registry, so every
//! receive callback it emits for a peer precedes that peer's disconnect
//! callback.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{ListenState, Shared};
use crate::callback::Event;
use crate::error::{Error, FailureKind, Message};
use crate::net::ReceiveOutcome;
use crate::peer::DisconnectReason;
use crate::registry::Removed;

pub(super) fn run(shared: Arc<Shared>) {
    debug!("listen worker started");

    while wait_for_work(&shared) {
        update_listener(&shared);
        accept(&shared);
        receive(&shared);
        cleanup(&shared);

        let mut state = shared.state.lock();
        if !state.shutdown {
            shared
                .listen_wakeup
                .wait_for(&mut state, shared.settings.sleep_time());
        }
    }

    debug!("listen worker stopped");
}

/// Blocks while there are no peers and no listener to drive. Returns `false`
/// on shutdown.
fn wait_for_work(shared: &Shared) -> bool {
    let mut state = shared.state.lock();

    while !state.shutdown && !state.has_listen_work() {
        trace!("listen worker idle");
        shared.listen_wakeup.wait(&mut state);
    }

    !state.shutdown
}

fn update_listener(shared: &Shared) {
    let event = {
        let mut state = shared.state.lock();
        let current = state.listen_state;

        match current {
            ListenState::Enabling | ListenState::Reconfiguring => {
                let (port, ip_version) = (state.listen_port, state.ip_version);
                state.listener.close();

                match state.listener.listen(port, ip_version) {
                    Ok(()) => {
                        state.listen_state = ListenState::Listening;

                        let effective = match state.listener.listen_port() {
                            0 => port,
                            bound => bound,
                        };
                        info!("listening on port {effective}");
                        Some(Event::StartedListening(effective))
                    }
                    Err(source) => {
                        state.listener.close();
                        state.listen_state = ListenState::Disabled;

                        let err = Error::Listen { port, source };
                        warn!("{err}");
                        Some(Event::ListenError(Message::from(&err)))
                    }
                }
            }
            ListenState::Disabling => {
                state.listener.close();
                state.listen_state = ListenState::Disabled;

                info!("stopped listening");
                Some(Event::StoppedListening)
            }
            ListenState::Disabled | ListenState::Listening => None,
        }
    };

    if let Some(event) = event {
        shared.dispatch(&event);
    }
}

fn accept(shared: &Shared) {
    let mut socket = {
        let mut state = shared.state.lock();
        if state.listen_state != ListenState::Listening {
            return;
        }

        let result = state.listener.accept();
        match result {
            Ok(Some(socket)) => socket,
            Ok(None) => return,
            Err(source) => {
                drop(state);

                let err = Error::Accept(source);
                warn!("{err}");
                shared.dispatch(&Event::ListenError(Message::from(&err)));
                return;
            }
        }
    };

    shared.configure(socket.as_mut());
    let ip_address = socket.peer_ip_address();
    let port = socket.peer_port();
    let host_name = socket.peer_name();

    let (peer, count) = {
        let mut state = shared.state.lock();
        if state.shutdown {
            socket.close();
            return;
        }
        let peer = state.registry.insert(ip_address, port, host_name, socket);
        (peer, state.registry.len())
    };

    info!("[{peer}] accepted, {count} peers connected");
    shared.dispatch(&Event::Accepted(peer));
}

fn receive(shared: &Shared) {
    let mut events = Vec::new();

    {
        let mut state = shared.state.lock();
        let mut closed = Vec::new();

        for (peer, socket) in state.registry.live_mut() {
            let id = peer.id();

            match socket.receive() {
                ReceiveOutcome::Data(data) => {
                    trace!("[{peer}] received {} bytes", data.len());
                    events.push(Event::Received(peer.clone(), data));
                }
                ReceiveOutcome::NothingAvailable => {}
                ReceiveOutcome::PeerDisconnected => {
                    closed.push((id, DisconnectReason::PeerClosedByRemote, None));
                }
                ReceiveOutcome::NotConnected => {
                    let message = Message::from(Error::NotConnected(id));
                    closed.push((id, DisconnectReason::ClosedDueToError, Some(message)));
                }
                ReceiveOutcome::IsListener => {
                    let message = Message::from(Error::IsListener(id));
                    closed.push((id, DisconnectReason::ClosedDueToError, Some(message)));
                }
                ReceiveOutcome::SystemError(source) => {
                    let err = Error::Receive { peer: id, source };
                    warn!("[{peer}] {err}");
                    let message = Message::from(&err);
                    closed.push((id, DisconnectReason::ClosedDueToError, Some(message)));
                }
            }
        }

        for (id, reason, message) in closed {
            state.registry.mark_pending_deletion(id, reason, message);
        }
    }

    for event in &events {
        shared.dispatch(event);
    }
}

fn cleanup(shared: &Shared) {
    let removed = shared.state.lock().registry.remove_if_pending();

    for Removed {
        peer,
        reason,
        message,
    } in removed
    {
        let event = match reason {
            DisconnectReason::PeerClosedByRemote => {
                info!("[{peer}] disconnected by remote");
                Event::Disconnected(peer)
            }
            DisconnectReason::ClosedByLocalRequest => {
                info!("[{peer}] closed");
                Event::Closed(peer)
            }
            DisconnectReason::ClosedDueToError => {
                let message = message.unwrap_or_else(|| {
                    Message::new(
                        FailureKind::ReceiveFailure.head(),
                        "connection closed due to an error",
                    )
                });
                warn!("[{peer}] closed due to error: {}", message.body);
                Event::FaultyConnectionClosed(peer, message)
            }
        };

        shared.dispatch(&event);
    }
}
