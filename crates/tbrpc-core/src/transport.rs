//! The transport seam.
//!
//! The protocol core needs exactly two things from a connection: a way to
//! send a text frame and a way to hear about inbound ones. Socket bindings
//! implement [`Transport`]; [`ChannelTransport`] is a ready-made
//! implementation over tokio channels that bindings and tests build on.

use crate::diagnostics::{Diagnostic, DiagnosticsSink, TracingSink};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;

/// Callback invoked once per inbound text frame.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A duplex, message-oriented text transport.
pub trait Transport: Send + Sync + 'static {
    /// Queue one text frame for the peer.
    ///
    /// Must not block. A frame sent on a transport that is no longer open is
    /// dropped, never queued or retried.
    fn send(&self, text: String);

    /// Register a handler for inbound frames. Registrations are additive.
    /// Frames may be delivered from any thread.
    fn on_message(&self, handler: MessageHandler);

    /// Stop delivering and sending, and release every registered handler.
    fn close(&self) {}
}

/// Additive list of inbound frame subscribers.
#[derive(Clone, Default)]
pub struct MessageHub {
    subscribers: Arc<RwLock<Vec<MessageHandler>>>,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: MessageHandler) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(handler);
    }

    /// Hand one frame to every subscriber.
    ///
    /// Subscribers run outside the lock, so a handler may subscribe further
    /// handlers without deadlocking.
    pub fn publish(&self, text: String) {
        let subscribers = self
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();

        if let Some((last, rest)) = subscribers.split_last() {
            for handler in rest {
                handler(text.clone());
            }
            last(text);
        }
    }

    pub fn clear(&self) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("subscriber lock poisoned").len()
    }
}

impl std::fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Transport over an unbounded tokio channel.
///
/// Outbound frames go into the channel; whoever owns the receiving end
/// (a socket writer task, or the peer of a [`pair`](Self::pair)) forwards
/// them. Inbound frames are pushed in with [`deliver`](Self::deliver).
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    hub: MessageHub,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ChannelTransport {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            hub: MessageHub::new(),
            diagnostics: Arc::new(TracingSink),
        }
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Two in-memory endpoints wired to each other.
    ///
    /// Must be called inside a tokio runtime: each direction is pumped by a
    /// spawned task. Closing either endpoint stops its outbound direction.
    pub fn pair() -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(ChannelTransport::new(a_tx));
        let b = Arc::new(ChannelTransport::new(b_tx));

        tokio::spawn(Self::pump(a_rx, Arc::downgrade(&b)));
        tokio::spawn(Self::pump(b_rx, Arc::downgrade(&a)));

        (a, b)
    }

    async fn pump(mut rx: mpsc::UnboundedReceiver<String>, to: Weak<ChannelTransport>) {
        while let Some(text) = rx.recv().await {
            match to.upgrade() {
                Some(transport) => transport.deliver(text),
                None => break,
            }
        }
    }

    /// Feed one inbound frame to the subscribers.
    pub fn deliver(&self, text: String) {
        self.hub.publish(text);
    }

    pub fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, text: String) {
        let outbound = self.outbound.lock().expect("outbound lock poisoned");
        let delivered = match outbound.as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        };
        drop(outbound);

        if !delivered {
            self.diagnostics.emit(&Diagnostic::SendDropped {
                reason: "transport closed".to_string(),
            });
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        self.hub.subscribe(handler);
    }

    fn close(&self) {
        self.outbound.lock().expect("outbound lock poisoned").take();
        self.hub.clear();
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("open", &self.is_open())
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hub_subscriptions_are_additive() {
        let hub = MessageHub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            hub.subscribe(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hub.publish("frame".to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        hub.clear();
        hub.publish("frame".to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_send_after_close_is_dropped_and_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(MemorySink::new());
        let transport = ChannelTransport::new(tx).with_diagnostics(sink.clone());

        transport.send("one".to_string());
        assert_eq!(rx.try_recv().unwrap(), "one");

        transport.close();
        assert!(!transport.is_open());
        transport.send("two".to_string());

        assert!(rx.try_recv().is_err());
        assert!(matches!(
            sink.events().as_slice(),
            [Diagnostic::SendDropped { .. }]
        ));
    }

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = ChannelTransport::pair();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let tx = seen_tx.clone();
        b.on_message(Arc::new(move |text| {
            let _ = tx.send(format!("b got {}", text));
        }));
        a.on_message(Arc::new(move |text| {
            let _ = seen_tx.send(format!("a got {}", text));
        }));

        a.send("hello".to_string());
        assert_eq!(seen_rx.recv().await.unwrap(), "b got hello");

        b.send("world".to_string());
        assert_eq!(seen_rx.recv().await.unwrap(), "a got world");
    }
}
