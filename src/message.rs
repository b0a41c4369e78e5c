// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The immutable envelope handed to message handlers. A message carries the
//! broker identifier, topic, optional tags, the raw payload and an
//! acknowledge callback bound to the broker entry it came from.

use futures_util::future::BoxFuture;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};
use tokio_util::sync::CancellationToken;

/// Callback that acknowledges one broker entry, resolving to `true` on success.
pub type AckFn = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Runs the acknowledge callback at most once successfully.
pub(crate) struct Acknowledger {
    acked: AtomicBool,
    ack: Option<AckFn>,
}

impl Acknowledger {
    fn new(ack: Option<AckFn>) -> Self {
        Acknowledger {
            acked: AtomicBool::new(false),
            ack,
        }
    }

    async fn acknowledge(&self, cancel: &CancellationToken) -> bool {
        if self.acked.swap(true, Ordering::AcqRel) {
            return true;
        }

        let Some(ack) = &self.ack else {
            return true;
        };

        let acked = tokio::select! {
            _ = cancel.cancelled() => false,
            ok = ack() => ok,
        };

        if !acked {
            self.acked.store(false, Ordering::Release);
        }

        acked
    }
}

/// A message received from a queue.
#[derive(Clone)]
pub struct Message {
    id: String,
    topic: String,
    tags: Option<String>,
    payload: Arc<Vec<u8>>,
    timestamp: SystemTime,
    acknowledger: Arc<Acknowledger>,
}

impl Message {
    /// Creates a message without an acknowledge callback.
    pub fn new(id: &str, topic: &str, tags: Option<&str>, payload: Vec<u8>) -> Message {
        Message {
            id: id.to_owned(),
            topic: topic.to_owned(),
            tags: tags.map(str::to_owned),
            payload: Arc::new(payload),
            timestamp: SystemTime::now(),
            acknowledger: Arc::new(Acknowledger::new(None)),
        }
    }

    /// The "no message available" sentinel. It is never dispatched to a handler.
    pub fn empty() -> Message {
        Message::new("", "", None, vec![])
    }

    /// Sets the broker timestamp of the message.
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Binds the acknowledge callback of the message.
    pub fn with_ack<F>(mut self, ack: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        self.acknowledger = Arc::new(Acknowledger::new(Some(Box::new(ack))));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tags(&self) -> Option<&str> {
        self.tags.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_empty() && self.payload.is_empty()
    }

    /// Whether `acknowledge` already succeeded for this message or one of its clones.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledger.acked.load(Ordering::Acquire)
    }

    /// Acknowledges the message on the broker.
    ///
    /// For durable-log entries this is the only way an entry is marked as
    /// consumed. Calling it again after a success returns `true` without
    /// contacting the broker; a failed or cancelled attempt may be retried.
    pub async fn acknowledge(&self, cancel: &CancellationToken) -> bool {
        self.acknowledger.acknowledge(cancel).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("tags", &self.tags)
            .field("payload_len", &self.payload.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(ok: bool) -> (Message, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let msg = Message::new("1-1", "orders", None, b"A".to_vec()).with_ack(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { ok }.boxed()
        });
        (msg, calls)
    }

    #[test]
    fn empty_sentinel() {
        let msg = Message::empty();
        assert!(msg.is_empty());
        assert!(!Message::new("1", "orders", None, vec![]).is_empty());
    }

    #[tokio::test]
    async fn acknowledge_reaches_broker_once() {
        let (msg, calls) = counting(true);
        let cancel = CancellationToken::new();

        assert!(msg.acknowledge(&cancel).await);
        assert!(msg.clone().acknowledge(&cancel).await);
        assert!(msg.is_acknowledged());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_acknowledge_can_be_retried() {
        let (msg, calls) = counting(false);
        let cancel = CancellationToken::new();

        assert!(!msg.acknowledge(&cancel).await);
        assert!(!msg.is_acknowledged());
        assert!(!msg.acknowledge(&cancel).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_acknowledge_returns_false() {
        let msg = Message::new("1-1", "orders", None, b"A".to_vec())
            .with_ack(|| futures_util::future::pending::<bool>().boxed());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!msg.acknowledge(&cancel).await);
        assert!(!msg.is_acknowledged());
    }

    #[tokio::test]
    async fn message_without_callback_acknowledges() {
        let msg = Message::new("1", "orders", Some("red"), b"A".to_vec());
        assert!(msg.acknowledge(&CancellationToken::new()).await);
        assert_eq!(msg.tags(), Some("red"));
    }
}
