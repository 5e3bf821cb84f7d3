use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use studyroom_core::net::messages::ServerMessage;
use studyroom_core::net::protocol::encode_server_message;
use studyroom_core::participant::ParticipantId;

/// Outbound channel of one WebSocket connection. Bounded, so a slow client
/// loses frames instead of growing server memory. `Bytes` keeps fan-out
/// clones cheap.
pub type ConnectionSender = mpsc::Sender<Bytes>;

/// Encode a server message once for fan-out. Encoding failures are logged
/// and yield `None`.
pub fn encode(msg: &ServerMessage) -> Option<Bytes> {
    match encode_server_message(msg) {
        Ok(data) => Some(Bytes::from(data)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server message");
            None
        },
    }
}

/// Subscribers of one room, keyed by participant. A participant holds at
/// most one subscription; subscribing again replaces the old connection.
#[derive(Debug, Default)]
pub struct RoomTopic {
    subscribers: HashMap<ParticipantId, ConnectionSender>,
}

impl RoomTopic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, id: ParticipantId, sender: ConnectionSender) {
        self.subscribers.insert(id, sender);
    }

    /// Drop the subscription only if it still belongs to `sender`. A newer
    /// connection of the same participant stays subscribed.
    pub fn unsubscribe(&mut self, id: &ParticipantId, sender: &ConnectionSender) -> bool {
        if self
            .subscribers
            .get(id)
            .is_some_and(|current| current.same_channel(sender))
        {
            self.subscribers.remove(id);
            return true;
        }
        false
    }

    pub fn remove(&mut self, id: &ParticipantId) {
        self.subscribers.remove(id);
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Push a frame to every subscriber. Full or closed queues are skipped.
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, room_code: &str, data: &Bytes) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for (id, sender) in &self.subscribers {
            match sender.try_send(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        participant = %id, room = room_code, error = %e,
                        "Skipping broadcast to slow client"
                    );
                },
            }
        }
        delivered
    }

    pub fn publish_message(&self, room_code: &str, msg: &ServerMessage) -> usize {
        encode(msg).map_or(0, |data| self.publish(room_code, &data))
    }

    /// Push a frame to one subscriber.
    pub fn send_to(&self, id: &ParticipantId, data: Bytes) -> bool {
        self.subscribers
            .get(id)
            .is_some_and(|sender| sender.try_send(data).is_ok())
    }
}
