//! Async message bus for decoupled channel-pipeline communication.
//!
//! Uses `tokio::sync::mpsc` for true multi-producer, single-consumer
//! semantics with backpressure. Outbound subscribers live in a shared
//! `Arc<RwLock<HashMap>>` so the dispatch loop never holds the bus's own
//! state locked while a callback runs.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error};

use events::{InboundMessage, OutboundReply};

type OutboundCallback = Box<dyn Fn(OutboundReply) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

pub type SubscriberMap = Arc<RwLock<HashMap<String, Vec<OutboundCallback>>>>;

/// Decouples chat channels (ingress transports) from the pipeline.
/// Channels push `InboundMessage`s onto the inbound sender; the pipeline
/// dispatcher (`gateway::bridge`) drains the inbound receiver and publishes
/// `OutboundReply`s back through the outbound channel to subscribers keyed
/// by `source` (e.g. `"telegram"`, `"cli"`).
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundReply>,
    subscribers: SubscriberMap,
}

pub struct MessageBusReceivers {
    pub inbound_rx: mpsc::Receiver<InboundMessage>,
    pub outbound_rx: mpsc::Receiver<OutboundReply>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, MessageBusReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        (Self { inbound_tx, outbound_tx, subscribers: Arc::new(RwLock::new(HashMap::new())) }, MessageBusReceivers { inbound_rx, outbound_rx })
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    pub async fn publish_outbound(&self, msg: OutboundReply) {
        if let Err(e) = self.outbound_tx.send(msg).await {
            error!("failed to publish outbound reply: {e}");
        }
    }

    pub fn subscribers(&self) -> SubscriberMap {
        Arc::clone(&self.subscribers)
    }

    /// Subscribes to outbound replies for a given `source` channel. Takes
    /// `&self` (not `&mut self`) — safe from any task since subscribers
    /// live behind an internal `RwLock`.
    pub async fn subscribe_outbound<F, Fut>(&self, source: &str, callback: F)
    where
        F: Fn(OutboundReply) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: OutboundCallback = Box::new(move |msg| Box::pin(callback(msg)));
        let mut subs = self.subscribers.write().await;
        subs.entry(source.to_string()).or_default().push(boxed);
    }
}

/// Routes each `OutboundReply` to all callbacks registered for its
/// `source`. Run as a background task via `tokio::spawn`; does not hold
/// the bus's own state, only the shared subscriber map.
pub async fn dispatch_outbound(subscribers: SubscriberMap, mut outbound_rx: mpsc::Receiver<OutboundReply>) {
    while let Some(msg) = outbound_rx.recv().await {
        let source = msg.source.clone();
        let subs = subscribers.read().await;
        if let Some(callbacks) = subs.get(&source) {
            for callback in callbacks {
                let fut = callback(msg.clone());
                if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(10), fut).await {
                    error!(source = %source, "outbound dispatch timed out: {e}");
                }
            }
        } else {
            debug!(source = %source, "no subscribers for outbound reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_send_receive() {
        let (bus, mut receivers) = MessageBus::new(16);
        let tx = bus.inbound_sender();

        tx.send(InboundMessage::cli(1, 1, "hello")).await.unwrap();

        let msg = receivers.inbound_rx.recv().await.unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.source, "cli");
    }

    #[tokio::test]
    async fn test_outbound_dispatch_to_subscriber() {
        let (bus, receivers) = MessageBus::new(16);

        let received = Arc::new(RwLock::new(Vec::<String>::new()));
        let received_clone = Arc::clone(&received);

        bus.subscribe_outbound("test_channel", move |msg: OutboundReply| {
            let captured = Arc::clone(&received_clone);
            async move {
                captured.write().await.push(msg.text);
            }
        })
        .await;

        let subs = bus.subscribers();
        let dispatch_handle = tokio::spawn(dispatch_outbound(subs, receivers.outbound_rx));

        bus.publish_outbound(OutboundReply { chat_id: 1, text: "hello subscriber".into(), source: "test_channel".into() }).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let msgs = received.read().await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0], "hello subscriber");

        drop(bus);
        let _ = dispatch_handle.await;
    }

    #[tokio::test]
    async fn test_subscribe_after_dispatch_started() {
        let (bus, receivers) = MessageBus::new(16);
        let subs = bus.subscribers();

        let dispatch_handle = tokio::spawn(dispatch_outbound(Arc::clone(&subs), receivers.outbound_rx));

        let received = Arc::new(RwLock::new(false));
        let received_clone = Arc::clone(&received);
        bus.subscribe_outbound("late_channel", move |_msg| {
            let flag = Arc::clone(&received_clone);
            async move {
                *flag.write().await = true;
            }
        })
        .await;

        bus.publish_outbound(OutboundReply { chat_id: 1, text: "late message".into(), source: "late_channel".into() }).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(*received.read().await);

        drop(bus);
        let _ = dispatch_handle.await;
    }
}
