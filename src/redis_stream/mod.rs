// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redis Streams Backend
//!
//! Durable-log backend: every topic is a Redis stream, grouped subscribers
//! share a consumer group, and each subscriber is driven by its own polling task.

pub mod client;
#[cfg(test)]
pub(crate) mod memory;
pub mod message_id;
pub mod poller;
pub mod queue;
pub mod redis;

/// Entry field holding the message payload.
pub const PAYLOAD_FIELD: &str = "payload";
/// Entry field holding the message tags.
pub const TAGS_FIELD: &str = "tags";
/// Entry field holding the JSON-encoded user properties.
pub const PROPS_FIELD: &str = "props";

pub use client::{StreamClient, StreamClientFactory};
pub use queue::RedisStreamQueue;
