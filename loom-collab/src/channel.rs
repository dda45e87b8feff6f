//! Transport seam between a [`SyncEngine`](crate::sync::SyncEngine) and
//! the authority.

use loom_core::{DocumentState, PropertyEdit};

use crate::protocol::{Ack, Rejection};

/// Outbound half of a connection. Sending is fire-and-forget: delivery
/// is confirmed only by a later [`ChannelEvent::Ack`].
pub trait EditChannel {
    fn send(&mut self, edit: &PropertyEdit);
}

/// Inbound events a transport hands to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// A sequenced edit from another client
    Edit(PropertyEdit),
    Ack(Ack),
    Rejected(Rejection),
    /// Full authority state, sent on (re)join
    StateSynced(DocumentState),
}

/// Collects sent edits in memory. Tests and in-process setups drain it
/// and deliver the edits to an authority themselves.
#[derive(Debug, Default)]
pub struct LoopbackChannel {
    outbox: Vec<PropertyEdit>,
    sent_total: u64,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything sent since the last call.
    pub fn take(&mut self) -> Vec<PropertyEdit> {
        std::mem::take(&mut self.outbox)
    }

    pub fn outbox(&self) -> &[PropertyEdit] {
        &self.outbox
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }
}

impl EditChannel for LoopbackChannel {
    fn send(&mut self, edit: &PropertyEdit) {
        self.outbox.push(edit.clone());
        self.sent_total += 1;
    }
}

impl<C: EditChannel + ?Sized> EditChannel for Box<C> {
    fn send(&mut self, edit: &PropertyEdit) {
        (**self).send(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::keys;
    use uuid::Uuid;

    #[test]
    fn test_loopback_collects_in_order() {
        let mut channel = LoopbackChannel::new();
        let client = Uuid::new_v4();
        for seq in 1..=3 {
            channel.send(&PropertyEdit::local(client, seq, Uuid::new_v4(), keys::X, 0.0f64.into()));
        }
        let sent = channel.take();
        assert_eq!(sent.iter().map(|e| e.client_seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(channel.outbox().is_empty());
        assert_eq!(channel.sent_total(), 3);
    }

    #[test]
    fn test_boxed_channel_forwards() {
        let mut boxed: Box<dyn EditChannel> = Box::new(LoopbackChannel::new());
        boxed.send(&PropertyEdit::local(Uuid::new_v4(), 1, Uuid::new_v4(), keys::Y, 1.0f64.into()));
    }
}
