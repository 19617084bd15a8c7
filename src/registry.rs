//! The table of established connections and its deferred-deletion protocol.
//!
//! Entries are created by the connect and listen workers, marked for deletion
//! by any worker or user request, and physically removed only by
//! [`PeerRegistry::remove_if_pending`], which the listen worker calls once per
//! iteration. Every method expects the caller to hold the data lock.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::Message;
use crate::net::Socket;
use crate::peer::{DisconnectReason, Peer, PeerId};

#[derive(Debug)]
struct PendingDeletion {
    reason: DisconnectReason,
    message: Option<Message>,
}

#[derive(Debug)]
struct Entry {
    peer: Peer,
    socket: Box<dyn Socket>,
    pending: Option<PendingDeletion>,
    /// Callbacks for this peer currently being dispatched by a worker other
    /// than the listen worker.
    pins: usize,
}

/// A peer that [`PeerRegistry::remove_if_pending`] took out of the table.
#[derive(Debug)]
pub(crate) struct Removed {
    pub(crate) peer: Peer,
    pub(crate) reason: DisconnectReason,
    pub(crate) message: Option<Message>,
}

#[derive(Debug)]
pub(crate) struct PeerRegistry {
    entries: HashMap<PeerId, Entry>,
    last_id: PeerId,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_id: 0,
        }
    }

    /// Registers an established connection under the next id.
    pub(crate) fn insert(
        &mut self,
        ip_address: String,
        port: u16,
        host_name: String,
        socket: Box<dyn Socket>,
    ) -> Peer {
        self.last_id += 1;
        let peer = Peer::new(self.last_id, ip_address, port, host_name);

        self.entries.insert(
            peer.id(),
            Entry {
                peer: peer.clone(),
                socket,
                pending: None,
                pins: 0,
            },
        );

        peer
    }

    pub(crate) fn find(&self, id: PeerId) -> Option<&Peer> {
        self.entries.get(&id).map(|entry| &entry.peer)
    }

    pub(crate) fn find_by_address(&self, ip_address: &str, port: u16) -> Option<&Peer> {
        self.entries
            .values()
            .map(|entry| &entry.peer)
            .filter(|peer| peer.ip_address() == ip_address && peer.port() == port)
            .max_by_key(|peer| peer.id())
    }

    pub(crate) fn is_pending(&self, id: PeerId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.pending.is_some())
    }

    /// Socket of a live (not pending) peer.
    pub(crate) fn socket_mut(&mut self, id: PeerId) -> Option<&mut Box<dyn Socket>> {
        self.entries
            .get_mut(&id)
            .filter(|entry| entry.pending.is_none())
            .map(|entry| &mut entry.socket)
    }

    /// Every live (not pending) peer with its socket.
    pub(crate) fn live_mut(&mut self) -> impl Iterator<Item = (&Peer, &mut Box<dyn Socket>)> {
        self.entries
            .values_mut()
            .filter(|entry| entry.pending.is_none())
            .map(|entry| (&entry.peer, &mut entry.socket))
    }

    /// Schedules a peer for removal. The first reason recorded wins.
    ///
    /// Returns `false` if the peer does not exist or was already pending.
    pub(crate) fn mark_pending_deletion(
        &mut self,
        id: PeerId,
        reason: DisconnectReason,
        message: Option<Message>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.pending.is_some() {
            trace!("[{}] already pending deletion, ignoring {reason:?}", entry.peer);
            return false;
        }

        debug!("[{}] marked for deletion: {reason:?}", entry.peer);
        entry.pending = Some(PendingDeletion { reason, message });
        true
    }

    /// Schedules every live peer for removal and returns how many were marked.
    pub(crate) fn mark_all_pending(&mut self, reason: DisconnectReason) -> usize {
        let ids: Vec<PeerId> = self.entries.keys().copied().collect();

        ids.into_iter()
            .filter(|id| self.mark_pending_deletion(*id, reason, None))
            .count()
    }

    /// Holds an entry in the table while a callback about it is dispatched.
    pub(crate) fn pin(&mut self, id: PeerId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pins += 1;
        }
    }

    pub(crate) fn unpin(&mut self, id: PeerId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Closes and removes every pending, unpinned entry.
    pub(crate) fn remove_if_pending(&mut self) -> Vec<Removed> {
        let ids: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.pending.is_some() && entry.pins == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut entry) = self.entries.remove(&id) else {
                continue;
            };
            let Some(pending) = entry.pending else {
                continue;
            };

            entry.socket.close();
            removed.push(Removed {
                peer: entry.peer,
                reason: pending.reason,
                message: pending.message,
            });
        }

        removed.sort_by_key(|removed| removed.peer.id());
        removed
    }

    pub(crate) fn snapshot(&self) -> HashMap<PeerId, Peer> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.peer.clone()))
            .collect()
    }

    /// The peer with the greatest id.
    pub(crate) fn latest(&self) -> Option<&Peer> {
        self.entries
            .values()
            .map(|entry| &entry.peer)
            .max_by_key(|peer| peer.id())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes and removes every entry without reporting anything.
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.entries.len();

        for (_, mut entry) in self.entries.drain() {
            entry.socket.close();
        }
        count
    }

    pub(crate) fn set_receive_buffer_size(&mut self, size: usize) {
        for entry in self.entries.values_mut() {
            entry.socket.set_receive_buffer_size(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::net::mock::MockSocket;

    fn add(registry: &mut PeerRegistry, port: u16) -> (Peer, MockSocket) {
        let sock = MockSocket::connected("127.0.0.1", port);
        let peer = registry.insert(
            "127.0.0.1".into(),
            port,
            "localhost".into(),
            Box::new(sock.clone()),
        );
        (peer, sock)
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut registry = PeerRegistry::new();

        let (a, _) = add(&mut registry, 4000);
        let (b, _) = add(&mut registry, 4001);

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(registry.latest(), Some(&b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut registry = PeerRegistry::new();

        let (a, _) = add(&mut registry, 4000);
        registry.mark_pending_deletion(a.id(), DisconnectReason::ClosedByLocalRequest, None);
        registry.remove_if_pending();
        let (b, _) = add(&mut registry, 4000);

        assert!(b.id() > a.id());
    }

    #[test]
    fn first_deletion_reason_wins() {
        let mut registry = PeerRegistry::new();
        let (peer, _) = add(&mut registry, 4000);

        assert!(registry.mark_pending_deletion(
            peer.id(),
            DisconnectReason::PeerClosedByRemote,
            None
        ));
        assert!(!registry.mark_pending_deletion(
            peer.id(),
            DisconnectReason::ClosedDueToError,
            Some(Message::new("Send Error", "broken pipe")),
        ));

        let removed = registry.remove_if_pending();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reason, DisconnectReason::PeerClosedByRemote);
        assert!(removed[0].message.is_none());
    }

    #[test]
    fn removal_closes_socket_and_forgets_peer() {
        let mut registry = PeerRegistry::new();
        let (keep, _) = add(&mut registry, 4000);
        let (gone, sock) = add(&mut registry, 4001);

        registry.mark_pending_deletion(gone.id(), DisconnectReason::ClosedByLocalRequest, None);
        assert!(registry.is_pending(gone.id()));
        assert!(registry.socket_mut(gone.id()).is_none());
        assert_eq!(registry.live_mut().count(), 1);

        let removed = registry.remove_if_pending();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer, gone);
        assert_eq!(sock.calls().close, 1);
        assert!(registry.find(gone.id()).is_none());
        assert_eq!(registry.find(keep.id()), Some(&keep));
        assert!(registry.remove_if_pending().is_empty());
    }

    #[test]
    fn pinned_entries_survive_cleanup() {
        let mut registry = PeerRegistry::new();
        let (peer, _) = add(&mut registry, 4000);

        registry.pin(peer.id());
        registry.mark_pending_deletion(peer.id(), DisconnectReason::ClosedDueToError, None);
        assert!(registry.remove_if_pending().is_empty());

        registry.unpin(peer.id());
        assert_eq!(registry.remove_if_pending().len(), 1);
    }

    #[test]
    fn mark_all_pending_skips_already_pending() {
        let mut registry = PeerRegistry::new();
        let (a, _) = add(&mut registry, 4000);
        add(&mut registry, 4001);
        add(&mut registry, 4002);

        registry.mark_pending_deletion(a.id(), DisconnectReason::PeerClosedByRemote, None);
        assert_eq!(registry.mark_all_pending(DisconnectReason::ClosedByLocalRequest), 2);

        let reasons: Vec<_> = registry
            .remove_if_pending()
            .into_iter()
            .map(|removed| removed.reason)
            .collect();
        assert_eq!(
            reasons,
            [
                DisconnectReason::PeerClosedByRemote,
                DisconnectReason::ClosedByLocalRequest,
                DisconnectReason::ClosedByLocalRequest,
            ]
        );
    }

    #[test]
    fn find_by_address_prefers_newest() {
        let mut registry = PeerRegistry::new();
        add(&mut registry, 4000);
        let (newer, _) = add(&mut registry, 4000);

        assert_eq!(registry.find_by_address("127.0.0.1", 4000), Some(&newer));
        assert!(registry.find_by_address("127.0.0.1", 4001).is_none());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut registry = PeerRegistry::new();
        let (peer, _) = add(&mut registry, 4000);

        let snapshot = registry.snapshot();
        registry.mark_pending_deletion(peer.id(), DisconnectReason::ClosedByLocalRequest, None);
        registry.remove_if_pending();

        assert_eq!(snapshot.get(&peer.id()), Some(&peer));
        assert!(registry.snapshot().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_closes_everything_silently() {
        let mut registry = PeerRegistry::new();
        let (_, a) = add(&mut registry, 4000);
        let (_, b) = add(&mut registry, 4001);

        assert_eq!(registry.drain(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.calls().close, 1);
        assert_eq!(b.calls().close, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert,
        Mark(usize, u8),
        Cleanup,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Insert),
            2 => (any::<usize>(), 0u8..3).prop_map(|(index, reason)| Op::Mark(index, reason)),
            1 => Just(Op::Cleanup),
        ]
    }

    fn reason(n: u8) -> DisconnectReason {
        match n {
            0 => DisconnectReason::PeerClosedByRemote,
            1 => DisconnectReason::ClosedByLocalRequest,
            _ => DisconnectReason::ClosedDueToError,
        }
    }

    proptest! {
        #[test]
        fn ids_stay_unique_and_removal_reports_first_reason(ops in prop::collection::vec(op(), 1..64)) {
            let mut registry = PeerRegistry::new();
            let mut issued = HashSet::new();
            let mut first_reason: HashMap<PeerId, DisconnectReason> = HashMap::new();
            let mut removed_ids = HashSet::new();

            for op in ops {
                match op {
                    Op::Insert => {
                        let (peer, _) = add(&mut registry, 4000);
                        prop_assert!(issued.insert(peer.id()));
                    }
                    Op::Mark(index, n) => {
                        let live: Vec<PeerId> = registry.snapshot().keys().copied().collect();
                        if live.is_empty() {
                            continue;
                        }
                        let id = live[index % live.len()];
                        registry.mark_pending_deletion(id, reason(n), None);
                        first_reason.entry(id).or_insert(reason(n));
                    }
                    Op::Cleanup => {
                        for removed in registry.remove_if_pending() {
                            let id = removed.peer.id();
                            prop_assert_eq!(Some(&removed.reason), first_reason.get(&id));
                            prop_assert!(removed_ids.insert(id));
                        }
                    }
                }
            }

            for id in registry.snapshot().keys() {
                prop_assert!(!removed_ids.contains(id));
            }
        }
    }
}
