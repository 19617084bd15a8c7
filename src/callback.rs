//! User callback table and the dispatch discipline every worker follows.
//!
//! Handlers live behind their own lock, independent of the data lock. A
//! dispatch clones the handler out of the table, releases the lock and only
//! then calls it, so a handler may freely call back into the node.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::Message;
use crate::peer::Peer;

/// Something the engine reports to its user.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    StartedListening(u16),
    StoppedListening,
    Accepted(Peer),
    Received(Peer, Vec<u8>),
    Disconnected(Peer),
    Closed(Peer),
    Connected(Peer),
    Sent(Peer, usize),
    FaultyConnectionClosed(Peer, Message),
    ListenError(Message),
    SendError(Message),
    ConnectError(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EventKind {
    StartedListening,
    StoppedListening,
    Accepted,
    Received,
    Disconnected,
    Closed,
    Connected,
    Sent,
    FaultyConnectionClosed,
    ListenError,
    SendError,
    ConnectError,
}

impl Event {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Event::StartedListening(_) => EventKind::StartedListening,
            Event::StoppedListening => EventKind::StoppedListening,
            Event::Accepted(_) => EventKind::Accepted,
            Event::Received(..) => EventKind::Received,
            Event::Disconnected(_) => EventKind::Disconnected,
            Event::Closed(_) => EventKind::Closed,
            Event::Connected(_) => EventKind::Connected,
            Event::Sent(..) => EventKind::Sent,
            Event::FaultyConnectionClosed(..) => EventKind::FaultyConnectionClosed,
            Event::ListenError(_) => EventKind::ListenError,
            Event::SendError(_) => EventKind::SendError,
            Event::ConnectError(_) => EventKind::ConnectError,
        }
    }
}

pub(crate) type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// At most one handler per [`EventKind`]; registering again replaces it.
#[derive(Default)]
pub(crate) struct Callbacks {
    handlers: Mutex<HashMap<EventKind, Handler>>,
}

impl Callbacks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, kind: EventKind, handler: Handler) {
        self.handlers.lock().insert(kind, handler);
    }

    /// Invokes the handler registered for `event`, if any.
    ///
    /// Must not be called while holding the data lock. A panicking handler is
    /// logged and otherwise ignored.
    pub(crate) fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let handler = self.handlers.lock().get(&kind).cloned();

        let Some(handler) = handler else {
            trace!("no handler registered for {kind:?}, dropping event");
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!("{kind:?} handler panicked");
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self
            .handlers
            .lock()
            .keys()
            .map(|kind| format!("{kind:?}"))
            .collect();
        kinds.sort();

        f.debug_struct("Callbacks").field("registered", &kinds).finish()
    }
}
