//! In-process delivery bus
//!
//! Maps locally-attached client ids to their connection handler channels so
//! broker-internal fan-out never touches the shared store. Cross-process hops
//! go through the cluster router; this registry is the same-process shortcut.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::QoS;

/// An application message addressed to one locally-attached client
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// Publish QoS; the handler downgrades to min(qos, granted)
    pub qos: QoS,
    pub retain: bool,
}

/// Command consumed by a connection handler's select loop
#[derive(Debug)]
pub enum ClientCommand {
    /// Deliver an application message to the client
    Deliver(Delivery),
    /// Close the connection without sending any frame (eviction)
    Kick,
}

/// Registry of locally-attached clients
#[derive(Default)]
pub struct LocalBus {
    clients: DashMap<Arc<str>, mpsc::Sender<ClientCommand>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Attach a client handler. Returns the previous handler's channel when
    /// the client id was already attached (duplicate-connection takeover).
    pub fn register(
        &self,
        client_id: Arc<str>,
        sender: mpsc::Sender<ClientCommand>,
    ) -> Option<mpsc::Sender<ClientCommand>> {
        self.clients.insert(client_id, sender)
    }

    /// Detach a client handler, but only if the stored channel is the one
    /// being detached. A takeover may already have replaced the entry.
    /// Returns true when this call removed the attachment; false means a
    /// newer attachment owns the slot (or none existed).
    pub fn unregister(&self, client_id: &str, sender: &mpsc::Sender<ClientCommand>) -> bool {
        self.clients
            .remove_if(client_id, |_, stored| stored.same_channel(sender))
            .is_some()
    }

    /// Hand a message to a locally-attached client. Returns false when the
    /// client is not attached here or its channel is full.
    pub fn deliver(&self, client_id: &str, delivery: Delivery) -> bool {
        match self.clients.get(client_id) {
            Some(sender) => {
                let ok = sender.try_send(ClientCommand::Deliver(delivery)).is_ok();
                if !ok {
                    trace!("Delivery channel full for {}", client_id);
                }
                ok
            }
            None => false,
        }
    }

    /// Ask a locally-attached client's handler to close without frames
    pub fn kick(&self, client_id: &str) -> bool {
        match self.clients.get(client_id) {
            Some(sender) => sender.try_send(ClientCommand::Kick).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of attached client ids (used at shutdown)
    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deliver_unregister() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id: Arc<str> = Arc::from("c1");

        assert!(bus.register(id.clone(), tx.clone()).is_none());
        assert!(bus.contains("c1"));

        assert!(bus.deliver(
            "c1",
            Delivery {
                topic: "t".into(),
                payload: Bytes::from("x"),
                qos: QoS::AtMostOnce,
                retain: false,
            }
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ClientCommand::Deliver(d)) if d.topic.as_ref() == "t"
        ));

        assert!(bus.unregister("c1", &tx));
        assert!(!bus.contains("c1"));
        assert!(!bus.unregister("c1", &tx));
        assert!(!bus.deliver(
            "c1",
            Delivery {
                topic: "t".into(),
                payload: Bytes::new(),
                qos: QoS::AtMostOnce,
                retain: false,
            }
        ));
    }

    #[tokio::test]
    async fn test_takeover_returns_old_sender() {
        let bus = LocalBus::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let id: Arc<str> = Arc::from("c1");

        assert!(bus.register(id.clone(), tx1.clone()).is_none());
        let old = bus.register(id.clone(), tx2.clone()).unwrap();
        assert!(old.same_channel(&tx1));

        // Old handler unregistering must not remove the new entry
        assert!(!bus.unregister("c1", &tx1));
        assert!(bus.contains("c1"));
    }

    #[tokio::test]
    async fn test_kick() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::channel(1);
        bus.register(Arc::from("c1"), tx);

        assert!(bus.kick("c1"));
        assert!(matches!(rx.recv().await, Some(ClientCommand::Kick)));
        assert!(!bus.kick("nobody"));
    }
}
