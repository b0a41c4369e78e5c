// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler is the user code a subscriber invokes for each delivered message.
//! Structs implement [`MessageHandler`] directly; closures are adapted with
//! [`handler_fn`].

use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Processes messages delivered to a subscriber.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. Errors are logged by the subscriber and never
    /// stop the receive loop; the message stays unacknowledged unless the
    /// handler acknowledged it before failing.
    async fn exec(&self, msg: &Message) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` so it can be registered as a handler.
///
/// ```ignore
/// let handler = handler_fn(|msg: Message| async move {
///     println!("{}", msg.topic());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn exec(&self, msg: &Message) -> HandlerResult {
        (self.f)(msg.clone()).await
    }
}
