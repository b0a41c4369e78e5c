// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stream Client Seam
//!
//! The subset of Redis Streams commands the durable-log backend relies on,
//! behind a trait so the consumer-group protocol can run against any client.

use crate::errors::QueueError;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// One stream entry and its field/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

/// One entry of a consumer's pending entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    /// How many times the entry was delivered.
    pub deliveries: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// `XADD`, returning the id assigned by the broker.
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        max_length: Option<usize>,
    ) -> Result<String, QueueError>;

    /// `XGROUP CREATE … MKSTREAM`; an existing group is not an error.
    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<(), QueueError>;

    /// `XREAD`: entries strictly after `after`.
    async fn read(&self, stream: &str, after: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError>;

    /// `XREADGROUP`: `>` for new entries, or an explicit id to re-read the
    /// consumer's own pending entries strictly after it.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError>;

    /// `XPENDING … IDLE`: entries held by `consumer` idle for at least
    /// `min_idle`, starting at `start` inclusive.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<PendingEntry>, QueueError>;

    /// `XRANGE` between two inclusive ids.
    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError>;

    /// Id of the newest entry, if the stream has any.
    async fn last_id(&self, stream: &str) -> Result<Option<String>, QueueError>;

    /// `XAUTOCLAIM`: moves entries idle for at least `min_idle` to `consumer`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<(), QueueError>;

    /// `XACK`, returning whether the entry was pending.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError>;
}

/// Opens stream clients; injected into the queue so tests can run without a broker.
#[async_trait]
pub trait StreamClientFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn StreamClient>, QueueError>;
}
