use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::RwLock;

use studyroom_core::net::messages::{PresenceMsg, ServerMessage};
use studyroom_core::participant::ParticipantId;

use crate::broadcast::{ConnectionSender, encode};

/// Which participants currently hold a live connection, and how to reach
/// them outside any room (invitations, presence updates).
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online: RwLock<HashMap<ParticipantId, ConnectionSender>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A second connection with the same id takes
    /// over delivery; the previous sender is returned.
    pub async fn register(
        &self,
        id: ParticipantId,
        sender: ConnectionSender,
    ) -> Option<ConnectionSender> {
        self.online.write().await.insert(id, sender)
    }

    /// Unregister only if `sender` is still the registered connection.
    pub async fn unregister(&self, id: &ParticipantId, sender: &ConnectionSender) -> bool {
        let mut online = self.online.write().await;
        if online
            .get(id)
            .is_some_and(|current| current.same_channel(sender))
        {
            online.remove(id);
            return true;
        }
        false
    }

    pub async fn count(&self) -> usize {
        self.online.read().await.len()
    }

    /// Online ids in sorted order.
    pub async fn online(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.online.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Best-effort delivery to one participant.
    pub async fn send_to(&self, id: &ParticipantId, data: Bytes) -> bool {
        let online = self.online.read().await;
        match online.get(id) {
            Some(sender) => match sender.try_send(data) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(participant = %id, error = %e, "Direct delivery failed");
                    false
                },
            },
            None => false,
        }
    }

    /// Push the current online list to every connection.
    pub async fn broadcast_presence(&self) {
        let online = self.online.read().await;
        let mut ids: Vec<ParticipantId> = online.keys().cloned().collect();
        ids.sort();
        let Some(data) = encode(&ServerMessage::Presence(PresenceMsg { online: ids })) else {
            return;
        };
        for (id, sender) in online.iter() {
            if let Err(e) = sender.try_send(data.clone()) {
                tracing::debug!(participant = %id, error = %e, "Skipping presence update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyroom_core::net::protocol::decode_server_message;
    use tokio::sync::mpsc;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let presence = PresenceRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        assert!(presence.register(pid("a"), tx.clone()).await.is_none());
        assert_eq!(presence.online().await, vec![pid("a")]);
        assert!(presence.unregister(&pid("a"), &tx).await);
        assert_eq!(presence.count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_survives_old_disconnect() {
        let presence = PresenceRegistry::new();
        let (old, _old_rx) = mpsc::channel(4);
        let (new, mut new_rx) = mpsc::channel(4);
        presence.register(pid("a"), old.clone()).await;
        assert!(presence.register(pid("a"), new).await.is_some());

        // The old connection closing must not take the new one offline.
        assert!(!presence.unregister(&pid("a"), &old).await);
        assert!(presence.send_to(&pid("a"), Bytes::from_static(b"hi")).await);
        assert_eq!(new_rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn send_to_offline_participant_fails() {
        let presence = PresenceRegistry::new();
        assert!(!presence.send_to(&pid("ghost"), Bytes::new()).await);
    }

    #[tokio::test]
    async fn presence_broadcast_lists_sorted_ids() {
        let presence = PresenceRegistry::new();
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_a, _rx_a) = mpsc::channel(4);
        presence.register(pid("b"), tx_b).await;
        presence.register(pid("a"), tx_a).await;
        presence.broadcast_presence().await;

        let frame = rx_b.recv().await.unwrap();
        match decode_server_message(&frame).unwrap() {
            ServerMessage::Presence(msg) => assert_eq!(msg.online, vec![pid("a"), pid("b")]),
            other => panic!("Expected Presence, got: {other:?}"),
        }
        assert_eq!(presence.count().await, 2);
    }
}
