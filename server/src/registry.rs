//! Connection registry — which live connection has claimed which identity.
//!
//! Process-local and rebuilt from nothing on restart; durable presence lives
//! in the gateway. Each entry also owns the sending half of the connection's
//! outbound queue, which is what the broadcast router writes into. Queues
//! are bounded: a frame offered to a full queue is dropped for that
//! recipient only.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{UserId, VideoId};

/// Opaque handle for one live transport.
pub type ConnId = Uuid;

/// A serialized frame, shared between all recipients of one broadcast.
pub type Outbound = Arc<str>;

pub type OutboundTx = mpsc::Sender<Outbound>;
pub type OutboundRx = mpsc::Receiver<Outbound>;

/// A connection's outbound queue, holding at most `capacity` frames.
pub fn outbound_queue(capacity: usize) -> (OutboundTx, OutboundRx) {
    mpsc::channel(capacity.max(1))
}

/// Identity claimed by a `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: UserId,
    pub video_id: VideoId,
}

#[derive(Debug)]
struct ConnectionEntry {
    identity: Option<Identity>,
    outbound: OutboundTx,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened connection. It has no identity until it joins.
    pub fn register(&self, conn: ConnId, outbound: OutboundTx) {
        self.conns.insert(conn, ConnectionEntry { identity: None, outbound });
    }

    /// Record (or replace) the identity of a connection.
    /// Returns false if the connection is not registered.
    pub fn set_identity(&self, conn: ConnId, identity: Identity) -> bool {
        match self.conns.get_mut(&conn) {
            Some(mut entry) => {
                entry.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub fn identity(&self, conn: ConnId) -> Option<Identity> {
        self.conns.get(&conn).and_then(|entry| entry.identity)
    }

    /// Forget a connection, handing back whatever identity it last claimed.
    /// Dropping the entry drops its outbound sender.
    pub fn remove(&self, conn: ConnId) -> Option<Identity> {
        self.conns.remove(&conn).and_then(|(_, entry)| entry.identity)
    }

    /// Connections currently joined to `video_id`.
    ///
    /// Walks the live map on every call. Do not mutate the registry while the
    /// iterator is alive; it holds shard read guards.
    pub fn connections_for_video(&self, video_id: VideoId) -> impl Iterator<Item = ConnId> + '_ {
        self.conns.iter().filter_map(move |entry| match entry.identity {
            Some(identity) if identity.video_id == video_id => Some(*entry.key()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Offer `frame` to each of `targets` still registered.
    /// Returns how many queues took it.
    pub(crate) fn deliver(&self, frame: &Outbound, targets: &[ConnId]) -> usize {
        targets
            .iter()
            .filter(|&&conn| match self.conns.get(&conn) {
                Some(entry) => offer(conn, &entry.outbound, frame),
                None => false,
            })
            .count()
    }

    /// Offer `frame` to every connection `accept` selects.
    pub(crate) fn fan_out<F>(&self, frame: &Outbound, accept: F) -> usize
    where
        F: Fn(ConnId) -> bool,
    {
        self.conns
            .iter()
            .filter(|entry| accept(*entry.key()) && offer(*entry.key(), &entry.outbound, frame))
            .count()
    }
}

/// Never waits: a full or closed queue skips this recipient.
fn offer(conn: ConnId, outbound: &OutboundTx, frame: &Outbound) -> bool {
    match outbound.try_send(Arc::clone(frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(conn = %conn, "outbound queue full, frame dropped");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(conn = %conn, "outbound queue closed, skipping");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(registry: &ConnectionRegistry) -> (ConnId, OutboundRx) {
        let conn = Uuid::new_v4();
        let (tx, rx) = outbound_queue(8);
        registry.register(conn, tx);
        (conn, rx)
    }

    #[test]
    fn identity_is_absent_until_joined() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = open(&registry);
        assert_eq!(registry.identity(conn), None);
        assert_eq!(registry.len(), 1);

        let identity = Identity { user_id: 1, video_id: 10 };
        assert!(registry.set_identity(conn, identity));
        assert_eq!(registry.identity(conn), Some(identity));
    }

    #[test]
    fn set_identity_on_unknown_connection_is_refused() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.set_identity(Uuid::new_v4(), Identity { user_id: 1, video_id: 1 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn rejoin_replaces_video_membership() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = open(&registry);
        registry.set_identity(conn, Identity { user_id: 1, video_id: 10 });
        registry.set_identity(conn, Identity { user_id: 1, video_id: 20 });

        assert_eq!(registry.connections_for_video(10).count(), 0);
        assert_eq!(registry.connections_for_video(20).collect::<Vec<_>>(), vec![conn]);
    }

    #[test]
    fn connections_for_video_reflects_live_state() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = open(&registry);
        let (b, _rb) = open(&registry);
        let (_unjoined, _ru) = open(&registry);
        registry.set_identity(a, Identity { user_id: 1, video_id: 10 });
        registry.set_identity(b, Identity { user_id: 2, video_id: 10 });

        let mut joined: Vec<_> = registry.connections_for_video(10).collect();
        joined.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(joined, expected);

        registry.remove(a);
        assert_eq!(registry.connections_for_video(10).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn full_queue_drops_only_for_that_recipient() {
        let registry = ConnectionRegistry::new();
        let slow = Uuid::new_v4();
        let (tx, mut slow_rx) = outbound_queue(1);
        registry.register(slow, tx);
        let (fast, mut fast_rx) = open(&registry);
        let frame: Outbound = Arc::from("{}");

        assert_eq!(registry.deliver(&frame, &[slow, fast]), 2);
        assert_eq!(registry.deliver(&frame, &[slow, fast]), 1);
        assert_eq!(registry.fan_out(&frame, |_| true), 1);

        assert_eq!(fast_rx.try_recv().as_deref(), Ok("{}"));
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());

        // Once drained, the slow reader is served again.
        assert_eq!(registry.deliver(&frame, &[slow]), 1);
    }

    #[test]
    fn deliver_skips_unknown_connections() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = open(&registry);
        let frame: Outbound = Arc::from("{}");

        assert_eq!(registry.deliver(&frame, &[Uuid::new_v4(), conn]), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn remove_returns_last_identity() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = open(&registry);
        let (never_joined, _rx2) = open(&registry);
        let identity = Identity { user_id: 4, video_id: 8 };
        registry.set_identity(conn, identity);

        assert_eq!(registry.remove(conn), Some(identity));
        assert_eq!(registry.remove(conn), None);
        assert_eq!(registry.remove(never_joined), None);
        assert!(registry.is_empty());
    }
}
