// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! A subscriber owns exactly one logical subscription: topic, tags, handler and
//! lifecycle state. Backends attach broker resources to it through [`Binding`],
//! either an event-driven broker consumer or a polling task.

use crate::{handler::MessageHandler, message::Message, options::SubscribeOptions};
use futures_util::FutureExt;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Separator between alternatives in a tag expression, e.g. `red||blue`.
pub const TAGS_SEPARATOR: &str = "||";

/// Registry identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub topic: String,
    pub tags: Option<String>,
}

impl SubscriptionKey {
    pub fn new(topic: &str, tags: Option<&str>) -> SubscriptionKey {
        SubscriptionKey {
            topic: topic.to_owned(),
            tags: tags.map(str::to_owned),
        }
    }
}

/// Broker resources held on behalf of a subscriber.
#[derive(Debug, Default)]
pub enum Binding {
    #[default]
    Unbound,
    /// Broker-pushed deliveries; `handle` is the consumer tag or topic filter.
    EventDriven { handle: String },
    /// A receive loop owned by the subscriber.
    Polling { task: JoinHandle<()> },
}

/// Outcome of handing a message to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler ran and returned successfully.
    Handled,
    /// The handler returned an error or panicked.
    Failed,
    /// The message tags do not match the subscription tags.
    Filtered,
    /// The subscriber was unsubscribed before the handler could run.
    Unsubscribed,
    /// The message was the empty sentinel.
    Empty,
}

fn polling(binding: &Binding) -> bool {
    matches!(binding, Binding::Polling { task } if !task.is_finished())
}

/// One registered subscription.
pub struct Subscriber {
    id: String,
    seq: u64,
    key: SubscriptionKey,
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
    unsubscribed: AtomicBool,
    cancel: CancellationToken,
    binding: Mutex<Binding>,
}

impl Subscriber {
    /// Creates a subscriber whose cancellation is linked to `parent`.
    pub(crate) fn new(
        seq: u64,
        key: SubscriptionKey,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
        parent: &CancellationToken,
    ) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4().to_string(),
            seq,
            key,
            handler,
            options,
            unsubscribed: AtomicBool::new(false),
            cancel: parent.child_token(),
            binding: Mutex::new(Binding::Unbound),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registration order within the owning queue.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn topic(&self) -> &str {
        &self.key.topic
    }

    pub fn tags(&self) -> Option<&str> {
        self.key.tags.as_deref()
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::Acquire)
    }

    /// Token cancelled when the subscriber is released or the queue disposed.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flags the subscriber as unsubscribed and stops its receive loop.
    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn mark_unsubscribed(&self) -> bool {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn lock_binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the broker binding, returning the previous one.
    pub(crate) fn bind(&self, binding: Binding) -> Binding {
        std::mem::replace(&mut *self.lock_binding(), binding)
    }

    pub(crate) fn take_binding(&self) -> Binding {
        self.bind(Binding::Unbound)
    }

    /// Whether a polling task is bound and still running.
    pub(crate) fn is_polling(&self) -> bool {
        polling(&self.lock_binding())
    }

    /// Binds the task returned by `spawn` unless a live polling task is
    /// already bound. `spawn` runs under the binding lock, so concurrent
    /// attaches start at most one task. Returns whether a task was started.
    pub(crate) fn bind_poller<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut binding = self.lock_binding();
        if polling(&binding) {
            return false;
        }
        *binding = Binding::Polling { task: spawn() };
        true
    }

    /// Whether the message tags satisfy this subscription's tag expression.
    ///
    /// A subscription without tags, or with `*`, accepts everything; otherwise
    /// the message must carry one of the `||`-separated alternatives.
    pub fn accepts(&self, msg: &Message) -> bool {
        match self.tags() {
            None | Some("") | Some("*") => true,
            Some(expected) => match msg.tags() {
                None => false,
                Some(actual) => expected
                    .split(TAGS_SEPARATOR)
                    .map(str::trim)
                    .any(|tag| tag == actual),
            },
        }
    }

    /// Hands `msg` to the handler, isolating handler errors and panics.
    pub async fn dispatch(&self, msg: Message) -> Dispatch {
        if msg.is_empty() {
            return Dispatch::Empty;
        }

        if !self.accepts(&msg) {
            debug!(topic = self.topic(), id = msg.id(), "message filtered by tags");
            return Dispatch::Filtered;
        }

        if self.is_unsubscribed() {
            debug!(topic = self.topic(), id = msg.id(), "dropping message for unsubscribed subscriber");
            return Dispatch::Unsubscribed;
        }

        match AssertUnwindSafe(self.handler.exec(&msg)).catch_unwind().await {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    topic = self.topic(),
                    id = msg.id(),
                    "failure to handle message"
                );
                Dispatch::Failed
            }
            Err(_) => {
                error!(topic = self.topic(), id = msg.id(), "message handler panicked");
                Dispatch::Failed
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("unsubscribed", &self.is_unsubscribed())
            .field("polling", &self.is_polling())
            .finish()
    }
}
