// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Backend
//!
//! Topic-broker backend over `lapin`: one connection and channel per queue,
//! a topic exchange for publishing and an event-driven consumer per subscription.

mod consumer;
mod otel;

pub mod channel;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use queue::AmqpQueue;
