//! Value types describing established connections.

use std::fmt;

/// Connection id assigned to a [`Peer`] when it is established.
pub type PeerId = u64;

/// One established TCP connection, inbound or outbound.
///
/// A `Peer` is a cheap snapshot of the connection's identity; the socket
/// itself stays owned by the engine. Ids are issued once, increase
/// monotonically and are never reused.
///
/// `Peer::default()` is the *null* peer: it is not valid and compares
/// unequal to every peer the engine hands out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Peer {
    id: PeerId,
    ip_address: String,
    port: u16,
    host_name: String,
    valid: bool,
}

impl Peer {
    /// Creates a valid peer. Only the registry issues ids.
    pub(crate) fn new(id: PeerId, ip_address: String, port: u16, host_name: String) -> Self {
        Self {
            id,
            ip_address,
            port,
            host_name,
            valid: true,
        }
    }

    /// Connection id of this peer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote IP address, as resolved when the connection was established.
    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Remote host name, or an empty string if the lookup failed.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Whether this peer describes an established connection.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return f.write_str("<null peer>");
        }

        if self.ip_address.contains(':') {
            write!(f, "#{} [{}]:{}", self.id, self.ip_address, self.port)
        } else {
            write!(f, "#{} {}:{}", self.id, self.ip_address, self.port)
        }
    }
}

/// Why a peer was removed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The remote end closed the connection (orderly shutdown).
    PeerClosedByRemote,
    /// The local user requested the disconnect.
    ClosedByLocalRequest,
    /// A socket error forced the connection closed.
    ClosedDueToError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_peer_is_invalid() {
        let peer = Peer::default();

        assert!(!peer.is_valid());
        assert_eq!(peer.to_string(), "<null peer>");
    }

    #[test]
    fn null_peer_never_equals_real_peer() {
        let real = Peer::new(1, "127.0.0.1".into(), 4200, "localhost".into());

        assert_ne!(Peer::default(), real);
        assert!(real.is_valid());
    }

    #[test]
    fn peers_with_different_ids_differ() {
        let a = Peer::new(1, "127.0.0.1".into(), 4200, String::new());
        let b = Peer::new(2, "127.0.0.1".into(), 4200, String::new());

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn display_brackets_ipv6() {
        let v4 = Peer::new(3, "10.0.0.1".into(), 80, String::new());
        let v6 = Peer::new(4, "::1".into(), 80, String::new());

        assert_eq!(v4.to_string(), "#3 10.0.0.1:80");
        assert_eq!(v6.to_string(), "#4 [::1]:80");
    }
}
