//! Send worker: writes queued buffers to their peers.

use std::io;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::Shared;
use crate::callback::Event;
use crate::error::{Error, Message};
use crate::peer::{DisconnectReason, PeerId};

pub(super) fn run(shared: Arc<Shared>) {
    debug!("send worker started");

    loop {
        let (id, data) = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    debug!("send worker stopped");
                    return;
                }
                if let Some(request) = state.send_queue.pop_front() {
                    break request;
                }
                shared.send_ready.wait(&mut state);
            }
        };

        send_one(&shared, id, &data);
    }
}

/// Performs one write and reports it. Each request yields exactly one send or
/// send-error callback.
fn send_one(shared: &Shared, id: PeerId, data: &[u8]) {
    let mut state = shared.state.lock();

    let Some(peer) = state.registry.find(id).cloned() else {
        drop(state);
        report_rejected(shared, Error::UnknownPeer(id));
        return;
    };
    let Some(socket) = state.registry.socket_mut(id) else {
        drop(state);
        report_rejected(shared, Error::PeerClosing(id));
        return;
    };

    let event = match socket.send(data) {
        Ok(n) if n > 0 => {
            trace!("[{peer}] sent {n} of {} bytes", data.len());
            Event::Sent(peer, n)
        }
        result => {
            let source = result
                .err()
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::WriteZero));
            let err = Error::Send {
                peer: id,
                len: data.len(),
                source,
            };
            warn!("[{peer}] {err}");

            let message = Message::from(&err);
            state.registry.mark_pending_deletion(
                id,
                DisconnectReason::ClosedDueToError,
                Some(message.clone()),
            );
            Event::SendError(message)
        }
    };

    state.registry.pin(id);
    drop(state);

    shared.dispatch(&event);

    shared.state.lock().registry.unpin(id);
    shared.listen_wakeup.notify_one();
}

fn report_rejected(shared: &Shared, err: Error) {
    debug!("{err}");
    shared.dispatch(&Event::SendError(Message::from(&err)));
}
