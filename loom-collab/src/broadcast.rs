//! Per-document fan-out of sequenced edits.
//!
//! Every connection joined to a document holds a receiver on its room's
//! tokio broadcast channel. A frame is encoded once and shared as
//! `Arc<Vec<u8>>`; connections skip frames whose `peer_id` is their own.
//! A receiver that falls more than the room's capacity behind loses the
//! oldest frames and is told how many via `RecvError::Lagged`, after which
//! the server resyncs it with a full state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use loom_core::DocumentId;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_sent: u64,
    /// Frames lagging receivers reported as lost
    pub frames_dropped: u64,
    pub peers: usize,
}

/// Connections to one document.
pub struct DocumentRoom {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl DocumentRoom {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and hand back its receiver. Only frames sent after
    /// this call are delivered.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        if let Some(previous) = peers.insert(info.peer_id, info) {
            log::debug!("Peer {} rejoined, replacing its old entry", previous.peer_id);
        }
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Encode once and send to every receiver, the originator included.
    /// Returns how many receivers got it.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Send already encoded bytes.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        // no receivers is not an error here
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped. Returns the room's
    /// running total.
    pub fn record_dropped(&self, skipped: u64) -> u64 {
        self.frames_dropped.fetch_add(skipped, Ordering::Relaxed) + skipped
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            peers: self.peer_count().await,
        }
    }
}

/// Rooms of the documents open on this node.
pub struct Rooms {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    capacity: usize,
}

impl Rooms {
    pub fn new(capacity: usize) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), capacity }
    }

    pub async fn get_or_create(&self, doc_id: DocumentId) -> Arc<DocumentRoom> {
        if let Some(room) = self.get(&doc_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms.entry(doc_id).or_insert_with(|| Arc::new(DocumentRoom::new(self.capacity))).clone()
    }

    pub async fn get(&self, doc_id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, doc_id: &DocumentId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id) else {
            return false;
        };
        if room.peer_count().await > 0 {
            return false;
        }
        rooms.remove(doc_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{keys, PropertyEdit};

    #[tokio::test]
    async fn test_room_add_remove() {
        let room = DocumentRoom::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = room.add_peer(peer.clone()).await;
        // a rejoin under the same id does not count twice
        let _rx2 = room.add_peer(peer).await;
        assert_eq!(room.peer_count().await, 1);

        assert!(room.remove_peer(&peer_id).await.is_some());
        assert!(room.remove_peer(&peer_id).await.is_none());
        assert_eq!(room.stats().await.peers, 0);
    }

    #[tokio::test]
    async fn test_edit_fan_out() {
        let room = DocumentRoom::new(16);
        let alice = PeerInfo::new("Alice");
        let mut rx1 = room.add_peer(alice.clone()).await;
        let mut rx2 = room.add_peer(PeerInfo::new("Bob")).await;
        let mut rx3 = room.add_peer(PeerInfo::new("Carol")).await;

        let edit = PropertyEdit::local(alice.peer_id, 1, Uuid::new_v4(), keys::X, 5.0f64.into())
            .with_sequence(1);
        let msg = SyncMessage::edit(Uuid::new_v4(), &edit).unwrap();
        // the originator receives it too and skips it by peer_id
        assert_eq!(room.broadcast(&msg).unwrap(), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            let decoded = SyncMessage::decode(&frame).unwrap();
            assert_eq!(decoded.peer_id, alice.peer_id);
            assert_eq!(decoded.property_edit().unwrap(), edit);
        }
    }

    #[tokio::test]
    async fn test_broadcast_raw_shares_bytes() {
        let room = DocumentRoom::new(16);
        let mut rx = room.add_peer(PeerInfo::new("Alice")).await;

        let data = Arc::new(vec![10, 20, 30]);
        assert_eq!(room.broadcast_raw(data.clone()), 1);
        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &data));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let room = DocumentRoom::new(4);
        assert_eq!(room.broadcast(&SyncMessage::ping(Uuid::new_v4())).unwrap(), 0);
        assert_eq!(room.stats().await.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let room = DocumentRoom::new(2);
        let mut rx = room.add_peer(PeerInfo::new("Slow")).await;
        for i in 0..5u8 {
            room.broadcast_raw(Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(room.record_dropped(n), 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(room.stats().await, RoomStats { frames_sent: 5, frames_dropped: 3, peers: 1 });
        // the newest frames survive
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_rooms_get_or_create() {
        let rooms = Rooms::new(16);
        let doc_id = Uuid::new_v4();

        let room1 = rooms.get_or_create(doc_id).await;
        let room2 = rooms.get_or_create(doc_id).await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert!(rooms.get(&doc_id).await.is_some());
        assert!(rooms.get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_rooms_cleanup() {
        let rooms = Rooms::new(16);
        let doc_id = Uuid::new_v4();
        let room = rooms.get_or_create(doc_id).await;
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;
        let _rx = room.add_peer(peer).await;

        assert!(!rooms.remove_if_empty(&doc_id).await);
        room.remove_peer(&peer_id).await;
        assert!(rooms.remove_if_empty(&doc_id).await);
        assert!(rooms.get(&doc_id).await.is_none());
        assert!(!rooms.remove_if_empty(&doc_id).await);
    }
}
