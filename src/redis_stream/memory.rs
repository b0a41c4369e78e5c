// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process [`StreamClient`] with consumer-group semantics, for tests.

use super::{
    client::{PendingEntry, StreamClient, StreamClientFactory, StreamEntry},
    message_id::MessageId,
};
use crate::errors::QueueError;
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

type Fields = HashMap<String, Vec<u8>>;

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, Pending>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<MessageId, Fields>,
    groups: HashMap<String, Group>,
    sequence: u64,
}

#[derive(Default)]
pub(crate) struct MemoryStreams {
    streams: Mutex<HashMap<String, Stream>>,
    pub connects: AtomicUsize,
    /// Number of upcoming group reads that fail as if the connection dropped.
    pub failing_reads: AtomicUsize,
}

impl MemoryStreams {
    pub(crate) fn new() -> Arc<MemoryStreams> {
        Arc::new(MemoryStreams::default())
    }

    pub(crate) fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().unwrap();
        streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub(crate) fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn take_failure(&self) -> Result<(), QueueError> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(QueueError::ConnectionError("connection reset".to_owned())),
            Err(_) => Ok(()),
        }
    }
}

fn parse(id: &str) -> Result<MessageId, QueueError> {
    id.parse()
}

fn entry(id: &MessageId, fields: &Fields) -> StreamEntry {
    StreamEntry {
        id: id.to_string(),
        fields: fields.clone(),
    }
}

fn no_group(group: &str) -> QueueError {
    QueueError::BrokerError(format!("NOGROUP {}", group))
}

#[async_trait]
impl StreamClient for MemoryStreams {
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        _max_length: Option<usize>,
    ) -> Result<String, QueueError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(stream.to_owned()).or_default();
        stream.sequence += 1;
        let id = MessageId::new(stream.sequence, 0);
        stream.entries.insert(id, fields.iter().cloned().collect());
        Ok(id.to_string())
    }

    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(stream.to_owned()).or_default();
        let last_delivered = match start {
            "$" => stream.entries.keys().next_back().copied().unwrap_or_default(),
            start => parse(start)?,
        };
        stream.groups.entry(group.to_owned()).or_insert_with(|| Group {
            last_delivered,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read(&self, stream: &str, after: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError> {
        let after = parse(after)?;
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|(id, _)| **id > after)
                    .take(count)
                    .map(|(id, fields)| entry(id, fields))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        self.take_failure()?;
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.get_mut(stream).ok_or_else(|| no_group(group))?;
        let Stream { entries, groups, .. } = stream;
        let state = groups.get_mut(group).ok_or_else(|| no_group(group))?;
        let now = Instant::now();

        if start == ">" {
            let fresh: Vec<_> = entries
                .iter()
                .filter(|(id, _)| **id > state.last_delivered)
                .take(count)
                .map(|(id, fields)| (*id, fields.clone()))
                .collect();

            for (id, _) in &fresh {
                state.last_delivered = *id;
                state.pending.insert(
                    *id,
                    Pending {
                        consumer: consumer.to_owned(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
            }

            return Ok(fresh.iter().map(|(id, fields)| entry(id, fields)).collect());
        }

        let start = parse(start)?;
        let mut found = vec![];
        for (id, pending) in state.pending.iter_mut() {
            if found.len() == count {
                break;
            }
            if *id <= start || pending.consumer != consumer {
                continue;
            }
            pending.deliveries += 1;
            pending.delivered_at = now;
            let fields = entries.get(id).cloned().unwrap_or_default();
            found.push(StreamEntry {
                id: id.to_string(),
                fields,
            });
        }
        Ok(found)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let start = parse(start)?;
        let streams = self.streams.lock().unwrap();
        let state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(group))?;

        Ok(state
            .pending
            .range(start..)
            .filter(|(_, p)| p.consumer == consumer && p.delivered_at.elapsed() >= min_idle)
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: id.to_string(),
                consumer: p.consumer.clone(),
                idle: p.delivered_at.elapsed(),
                deliveries: p.deliveries,
            })
            .collect())
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError> {
        let (start, end) = (parse(start)?, parse(end)?);
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .map(|s| {
                s.entries
                    .range(start..=end)
                    .take(count)
                    .map(|(id, fields)| entry(id, fields))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_id(&self, stream: &str) -> Result<Option<String>, QueueError> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .and_then(|s| s.entries.keys().next_back())
            .map(|id| id.to_string()))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Err(no_group(group));
        };

        for pending in state
            .pending
            .values_mut()
            .filter(|p| p.delivered_at.elapsed() >= min_idle)
            .take(count)
        {
            pending.consumer = consumer.to_owned();
            pending.delivered_at = Instant::now();
        }
        Ok(())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError> {
        let id = parse(id)?;
        let mut streams = self.streams.lock().unwrap();
        Ok(streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }
}

/// Hands out the same [`MemoryStreams`] on every connect.
pub(crate) struct MemoryFactory(pub Arc<MemoryStreams>);

#[async_trait]
impl StreamClientFactory for MemoryFactory {
    async fn create(&self) -> Result<Arc<dyn StreamClient>, QueueError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.clone())
    }
}
