//! Error values produced inside the engine and the [`Message`] they are
//! reported as.
//!
//! No error ever crosses the engine boundary as a `Result`. Workers build an
//! [`Error`], convert it into a [`Message`], and hand that to the matching
//! callback.

use std::error::Error as _;
use std::time::Duration;
use std::{fmt, io, result};

use crate::peer::PeerId;

/// Creates an [`io::Error`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        ::std::io::Error::new(errno.kind(), msg)
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [`crate::Error`].
pub type Result<T> = result::Result<T, Error>;

/// Represents failures that can occur while the engine manages connections.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Establishing an outbound connection failed at the socket level.
    #[error("failed to connect to {target}")]
    Connect {
        /// `ip:port` that was dialed.
        target: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// An outbound connection did not complete within the connect timeout.
    #[error("failed to connect to {target}: timed out after {} ms", .elapsed.as_millis())]
    ConnectTimeout {
        /// `ip:port` that was dialed.
        target: String,
        /// Time spent retrying before giving up.
        elapsed: Duration,
    },
    /// The listening socket could not be created, bound or put into the
    /// listening state.
    #[error("failed to create listener on port {port}")]
    Listen {
        /// Requested listen port.
        port: u16,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Accepting an incoming connection failed with something other than
    /// "would block".
    #[error("failed to accept incoming connection")]
    Accept(#[source] io::Error),
    /// A send was requested for a peer that is not in the registry.
    #[error("cannot send to peer {0}: peer does not exist")]
    UnknownPeer(PeerId),
    /// A send was requested for a peer that is already scheduled for
    /// disconnection.
    #[error("cannot send to peer {0}: peer is being disconnected")]
    PeerClosing(PeerId),
    /// Writing to a peer socket failed or made no progress.
    #[error("failed to send {len} bytes to peer {peer}")]
    Send {
        /// Target peer.
        peer: PeerId,
        /// Size of the buffer that was handed to the socket.
        len: usize,
        /// Underlying OS error, or a `WriteZero` error if nothing was written.
        #[source]
        source: io::Error,
    },
    /// Reading from a peer socket failed.
    #[error("failed to receive from peer {peer}")]
    Receive {
        /// Source peer.
        peer: PeerId,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A peer socket reported that it is no longer connected.
    #[error("socket of peer {0} is not connected")]
    NotConnected(PeerId),
    /// A peer socket reported that it is a listener.
    #[error("socket of peer {0} is a listener")]
    IsListener(PeerId),
    /// Configuration values passed to the engine are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// The class of operation an [`Error`] belongs to.
///
/// Disconnects are not failures of their own; they are reported with a
/// [`DisconnectReason`](crate::DisconnectReason) instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeout or OS-level failure while dialing.
    ConnectFailure,
    /// Bind/listen failure or accept failure.
    ListenFailure,
    /// Peer absent, write error, or a write that made no progress.
    SendFailure,
    /// Socket-level receive error distinct from an orderly disconnect.
    ReceiveFailure,
    /// Rejected configuration.
    ConfigFailure,
}

impl FailureKind {
    /// Short human-readable head used for [`Message::head`].
    pub fn head(self) -> &'static str {
        match self {
            FailureKind::ConnectFailure => "Connect Error",
            FailureKind::ListenFailure => "Listen Error",
            FailureKind::SendFailure => "Send Error",
            FailureKind::ReceiveFailure => "Receive Error",
            FailureKind::ConfigFailure => "Config Error",
        }
    }
}

impl Error {
    /// Returns the class of operation that failed.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Connect { .. } | Error::ConnectTimeout { .. } => FailureKind::ConnectFailure,
            Error::Listen { .. } | Error::Accept(_) => FailureKind::ListenFailure,
            Error::UnknownPeer(_) | Error::PeerClosing(_) | Error::Send { .. } => {
                FailureKind::SendFailure
            }
            Error::Receive { .. } | Error::NotConnected(_) | Error::IsListener(_) => {
                FailureKind::ReceiveFailure
            }
            Error::InvalidConfig(_) => FailureKind::ConfigFailure,
        }
    }

    /// Returns the OS error carried by this failure, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        self.source()?.downcast_ref::<io::Error>()
    }
}

/// Diagnostic delivered to error callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Short description of the failed operation, e.g. `"Send Error"`.
    pub head: String,
    /// Details, including the OS error number and string when known.
    pub body: String,
}

impl Message {
    /// Creates a new `Message`.
    pub fn new(head: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            body: body.into(),
        }
    }
}

impl From<&Error> for Message {
    fn from(err: &Error) -> Self {
        let mut body = err.to_string();

        if let Some(os) = err.os_error() {
            match os.raw_os_error() {
                Some(code) => {
                    body.push_str(&format!("\nError number {code}: {os}"));
                }
                None => {
                    body.push_str(&format!("\n{os}"));
                }
            }
        }

        Message::new(err.kind().head(), body)
    }
}

impl From<Error> for Message {
    fn from(err: Error) -> Self {
        Message::from(&err)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.head, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_head_follows_failure_kind() {
        let err = Error::UnknownPeer(7);
        let msg = Message::from(&err);

        assert_eq!(msg.head, "Send Error");
        assert_eq!(msg.body, "cannot send to peer 7: peer does not exist");
    }

    #[test]
    fn message_body_carries_os_error_number() {
        let err = Error::Connect {
            target: "127.0.0.1:1".into(),
            source: io::Error::from_raw_os_error(libc::ECONNREFUSED),
        };
        let msg = Message::from(&err);

        assert_eq!(msg.head, "Connect Error");
        assert!(msg.body.starts_with("failed to connect to 127.0.0.1:1"));
        assert!(msg.body.contains(&format!("Error number {}", libc::ECONNREFUSED)));
    }

    #[test]
    fn timeout_reports_elapsed_time() {
        let err = Error::ConnectTimeout {
            target: "10.255.255.1:9".into(),
            elapsed: Duration::from_millis(250),
        };

        assert_eq!(err.kind(), FailureKind::ConnectFailure);
        assert!(err.os_error().is_none());
        assert_eq!(
            err.to_string(),
            "failed to connect to 10.255.255.1:9: timed out after 250 ms"
        );
    }

    #[test]
    fn receive_failures_map_to_receive_kind() {
        assert_eq!(Error::NotConnected(1).kind(), FailureKind::ReceiveFailure);
        assert_eq!(Error::IsListener(1).kind(), FailureKind::ReceiveFailure);
        assert_eq!(
            Error::Accept(io::Error::from_raw_os_error(libc::EMFILE)).kind(),
            FailureKind::ListenFailure
        );
    }
}
