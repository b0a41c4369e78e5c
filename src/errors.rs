// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Abstraction
//!
//! This module provides the error type shared by every backend. The `QueueError`
//! enum classifies failures into transient connection faults, configuration
//! faults, resource faults and broker operation faults, so callers can decide
//! whether a retry makes sense.

use thiserror::Error;

/// Represents errors that can occur during queue operations.
///
/// The enum is `Clone` so a single failed connection attempt can be reported
/// to every caller that was waiting on the same attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing or keeping a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// The queue was used after it was disposed
    #[error("queue `{0}` was disposed")]
    Disposed(String),

    /// Invalid or missing configuration
    #[error("invalid configuration `{0}`")]
    Configuration(String),

    /// Invalid argument passed by the caller
    #[error("invalid argument `{0}`")]
    InvalidArgument(String),

    /// A durable-log message id could not be parsed
    #[error("invalid message id `{0}`")]
    InvalidMessageId(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error registering a subscription on the broker
    #[error("failure to subscribe `{0}`")]
    SubscribeError(String),

    /// Error publishing a message to the dead-letter stream
    #[error("failure to publish to dead letter `{0}`")]
    PublishingToDeadLetterError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Any other error reported by the broker
    #[error("broker error `{0}`")]
    BrokerError(String),
}

impl QueueError {
    /// Transient faults are recovered by reconnecting; everything else is
    /// reported to the caller as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::ConnectionError(_) | QueueError::ChannelError)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            QueueError::ConnectionError(err.to_string())
        } else {
            QueueError::BrokerError(err.to_string())
        }
    }
}
