//! Several sync engines against one in-process authority.
//!
//! Edits travel through `LoopbackChannel` outboxes into `Authority::submit`;
//! fan-out arrives over the document's broadcast room and acknowledgements
//! are delivered by hand, so tests control every interleaving.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use loom_collab::{
    Ack, Authority, LoopbackChannel, PeerInfo, PersistenceConfig, PersistenceEngine, SyncEngine,
    SyncMessage,
};
use loom_core::{keys, ChangeOrigin, DocumentId, PropertyValue, StateChange};
use tokio::sync::broadcast;
use uuid::Uuid;

struct Client {
    engine: SyncEngine<LoopbackChannel>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    acks: VecDeque<Ack>,
}

impl Client {
    async fn join(authority: &Authority, doc: DocumentId) -> Self {
        let id = Uuid::new_v4();
        let room = authority.open_document(doc).await.unwrap();
        let rx = room.add_peer(PeerInfo::with_id(id, "client")).await;
        let mut engine = SyncEngine::new(id, LoopbackChannel::new());
        engine.on_reconnect();
        engine.on_state_sync(authority.snapshot(doc).await.unwrap());
        Self { engine, rx, acks: VecDeque::new() }
    }

    /// Submit everything in the outbox; acks are held until `deliver_acks`.
    async fn flush(&mut self, authority: &Authority, doc: DocumentId) {
        for edit in self.engine.channel_mut().take() {
            let client_seq = edit.client_seq;
            let confirmed = authority.submit(doc, edit).await.unwrap();
            self.acks.push_back(Ack { client_seq, sequence: confirmed.sequence.unwrap() });
        }
    }

    fn deliver_acks(&mut self) {
        while let Some(ack) = self.acks.pop_front() {
            self.engine.on_local_edit_confirmed(ack);
        }
    }

    fn deliver_remote(&mut self) {
        while let Ok(frame) = self.rx.try_recv() {
            let msg = SyncMessage::decode(&frame).unwrap();
            if msg.peer_id == self.engine.client_id() {
                continue;
            }
            self.engine.on_remote_edit(msg.property_edit().unwrap());
        }
    }
}

fn authority() -> Authority {
    Authority::new(Arc::new(PersistenceEngine::in_memory(PersistenceConfig::for_testing())), 256)
}

#[tokio::test]
async fn test_clients_converge_on_authority_state() {
    let authority = authority();
    let doc = Uuid::new_v4();
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(Client::join(&authority, doc).await);
    }
    let shared = Uuid::new_v4();

    // everyone edits the same keys before anything is submitted
    for (i, client) in clients.iter_mut().enumerate() {
        client.engine.apply_local_edit(shared, keys::X, (i as f64).into()).unwrap();
        client.engine.apply_local_edit(shared, keys::WIDTH, (10.0 * i as f64).into()).unwrap();
        client.engine.apply_local_edit(Uuid::new_v4(), keys::NAME, format!("own-{i}").into()).unwrap();
    }

    // submission order differs from creation order
    for i in [2, 0, 3, 1] {
        clients[i].flush(&authority, doc).await;
    }

    // half see remote edits before their acks, half after
    for (i, client) in clients.iter_mut().enumerate() {
        if i % 2 == 0 {
            client.deliver_remote();
            client.deliver_acks();
        } else {
            client.deliver_acks();
            client.deliver_remote();
        }
    }

    let truth = authority.snapshot(doc).await.unwrap();
    // client 1 was submitted last
    assert_eq!(truth.value(shared, keys::X), Some(&PropertyValue::Number(1.0)));
    for client in &clients {
        assert_eq!(client.engine.unacked_count(), 0);
        assert_eq!(client.engine.state(), &truth);
    }
}

#[tokio::test]
async fn test_pending_edit_never_flickers() {
    let authority = authority();
    let doc = Uuid::new_v4();
    let mut alice = Client::join(&authority, doc).await;
    let mut bob = Client::join(&authority, doc).await;

    let seen: Arc<Mutex<Vec<StateChange>>> = Arc::default();
    let sink = seen.clone();
    alice.engine.subscribe(move |c| sink.lock().unwrap().push(c.clone()));

    let obj = Uuid::new_v4();
    alice.engine.apply_local_edit(obj, keys::X, 1.0f64.into()).unwrap();
    bob.engine.apply_local_edit(obj, keys::X, 2.0f64.into()).unwrap();

    // bob is sequenced first, alice second
    bob.flush(&authority, doc).await;
    alice.flush(&authority, doc).await;

    // bob's edit reaches alice while hers is still unacknowledged
    alice.deliver_remote();
    assert_eq!(alice.engine.value(obj, keys::X), Some(&1.0f64.into()));
    alice.deliver_acks();

    bob.deliver_acks();
    bob.deliver_remote();

    let values: Vec<Option<PropertyValue>> = seen.lock().unwrap().iter().map(|c| c.value.clone()).collect();
    assert!(values.iter().all(|v| *v == Some(PropertyValue::Number(1.0))));
    assert_eq!(seen.lock().unwrap().last().map(|c| c.origin), Some(ChangeOrigin::Confirmed));
    assert_eq!(alice.engine.state(), bob.engine.state());
    assert_eq!(bob.engine.value(obj, keys::X), Some(&1.0f64.into()));
}

#[tokio::test]
async fn test_late_joiner_bootstraps_from_snapshot() {
    let authority = authority();
    let doc = Uuid::new_v4();
    let mut early = Client::join(&authority, doc).await;

    let frame = Uuid::new_v4();
    early.engine.apply_local_edit(frame, keys::KIND, "container".into()).unwrap();
    early.engine.apply_local_edit(frame, keys::WIDTH, 320.0f64.into()).unwrap();
    early.flush(&authority, doc).await;
    early.deliver_acks();

    let late = Client::join(&authority, doc).await;
    assert_eq!(late.engine.state(), early.engine.state());
    assert_eq!(late.engine.value(frame, keys::WIDTH), Some(&320.0f64.into()));
}

#[tokio::test]
async fn test_offline_queue_resent_after_reconnect() {
    let authority = authority();
    let doc = Uuid::new_v4();
    let mut alice = Client::join(&authority, doc).await;
    let mut bob = Client::join(&authority, doc).await;
    let obj = Uuid::new_v4();

    alice.engine.on_disconnect();
    for i in 1..=3 {
        alice.engine.apply_local_edit(obj, keys::Y, (i as f64).into()).unwrap();
    }
    assert!(alice.engine.channel().outbox().is_empty());
    assert_eq!(alice.engine.value(obj, keys::Y), Some(&3.0f64.into()));

    assert_eq!(alice.engine.on_reconnect(), 3);
    alice.flush(&authority, doc).await;
    alice.deliver_acks();
    bob.deliver_remote();

    assert_eq!(bob.engine.value(obj, keys::Y), Some(&3.0f64.into()));
    assert_eq!(authority.snapshot(doc).await.unwrap().sequence_of(obj, keys::Y), Some(3));
    assert_eq!(alice.engine.state(), bob.engine.state());
}

#[tokio::test]
async fn test_deleted_object_converges() {
    let authority = authority();
    let doc = Uuid::new_v4();
    let mut alice = Client::join(&authority, doc).await;
    let mut bob = Client::join(&authority, doc).await;
    let obj = Uuid::new_v4();

    alice.engine.apply_local_edit(obj, keys::NAME, "doomed".into()).unwrap();
    alice.flush(&authority, doc).await;
    alice.deliver_acks();
    bob.deliver_remote();

    bob.engine.delete_object(obj).unwrap();
    bob.engine.delete_object(obj).unwrap();
    bob.flush(&authority, doc).await;
    bob.deliver_acks();
    alice.deliver_remote();

    assert_eq!(alice.engine.value(obj, keys::DELETED), Some(&PropertyValue::Bool(true)));
    assert_eq!(alice.engine.state(), bob.engine.state());
}
