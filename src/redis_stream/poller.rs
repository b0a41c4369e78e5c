// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer-Group Poller
//!
//! Drives one subscriber over a Redis stream. Grouped subscribers alternate
//! between new entries (`XREADGROUP >`) and their own stale pending entries,
//! periodically claim entries abandoned by crashed consumers, and move
//! entries that exceeded the delivery budget to `{stream}:DEAD!`.
//! Ungrouped subscribers read the stream as a broadcast log.

use super::{
    client::{StreamClient, StreamEntry},
    message_id::{decrement, increment, MessageId},
    PAYLOAD_FIELD, TAGS_FIELD,
};
use crate::{errors::QueueError, message::Message};
use futures_util::FutureExt;
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, warn};

/// Suffix of the stream holding entries that exceeded their delivery budget.
pub const DEAD_LETTER_SUFFIX: &str = ":DEAD!";

/// Claiming resets the idle time of every claimed entry, so it must not run
/// more often than this.
const CLAIM_INTERVAL_FLOOR: Duration = Duration::from_secs(60 * 60);

pub fn dead_letter_stream(stream: &str) -> String {
    format!("{}{}", stream, DEAD_LETTER_SUFFIX)
}

/// Read position of one subscriber.
#[derive(Debug, Default)]
pub struct Cursor {
    /// Last entry seen by an ungrouped subscriber.
    pub last_message_id: Option<String>,
    pub last_claim: Option<Instant>,
    /// Last pending entry visited by the backlog scan.
    pub pending_cursor: Option<String>,
    /// Whether the next cycle starts with the pending backlog.
    pub processing_pending: bool,
}

pub struct StreamPoller {
    stream: String,
    topic: String,
    group: Option<String>,
    consumer: String,
    idle_timeout: Duration,
    deadline: u64,
    batch: usize,
    cursor: Cursor,
}

impl StreamPoller {
    /// Creates a poller with the default idle timeout, deadline and batch.
    ///
    /// # Parameters
    /// * `stream` - Redis key of the stream
    /// * `topic` - Topic set on the produced messages
    /// * `group` - Consumer group, or `None` to read new entries only
    /// * `consumer` - Consumer name within the group
    pub fn new(stream: &str, topic: &str, group: Option<&str>, consumer: &str) -> StreamPoller {
        StreamPoller {
            stream: stream.to_owned(),
            topic: topic.to_owned(),
            group: group.map(str::to_owned),
            consumer: consumer.to_owned(),
            idle_timeout: Duration::from_secs(30),
            deadline: 10_000,
            batch: 10,
            cursor: Cursor::default(),
        }
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Deliveries after which a pending entry is dead-lettered; `0` disables it.
    pub fn deadline(mut self, deadline: u64) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn is_grouped(&self) -> bool {
        self.group.is_some()
    }

    /// Runs one polling cycle. Returns [`Message::empty`] when nothing is available.
    pub async fn poll(&mut self, client: &Arc<dyn StreamClient>) -> Result<Message, QueueError> {
        match self.group.clone() {
            Some(group) => self.poll_group(client, &group).await,
            None => self.poll_broadcast(client).await,
        }
    }

    async fn poll_group(&mut self, client: &Arc<dyn StreamClient>, group: &str) -> Result<Message, QueueError> {
        self.claim_stale(client, group);

        if self.cursor.processing_pending {
            self.cursor.processing_pending = false;

            let msg = self.poll_pending(client, group).await?;
            if !msg.is_empty() {
                return Ok(msg);
            }
        }

        let fresh = client
            .read_group(&self.stream, group, &self.consumer, ">", 1)
            .await?;

        match fresh.into_iter().next() {
            Some(entry) => Ok(self.to_message(client, entry)),
            None => {
                self.cursor.processing_pending = true;
                Ok(Message::empty())
            }
        }
    }

    async fn poll_pending(&mut self, client: &Arc<dyn StreamClient>, group: &str) -> Result<Message, QueueError> {
        let start = match &self.cursor.pending_cursor {
            Some(id) => increment(id)?,
            None => "-".to_owned(),
        };

        let pending = client
            .pending(
                &self.stream,
                group,
                &self.consumer,
                &start,
                self.batch,
                self.idle_timeout,
            )
            .await?;

        if pending.is_empty() {
            self.cursor.pending_cursor = None;
            return Ok(Message::empty());
        }

        for entry in pending {
            self.cursor.pending_cursor = Some(entry.id.clone());

            if self.exceeds_deadline(entry.deliveries) {
                self.dead_letter(client, group, &entry.id).await?;
                continue;
            }

            // reading after the previous id returns this consumer's pending entry itself
            let replay = client
                .read_group(&self.stream, group, &self.consumer, &decrement(&entry.id)?, 1)
                .await?;

            match replay.into_iter().next() {
                Some(found) if found.id == entry.id && found.fields.is_empty() => {
                    debug!(stream = self.stream, id = entry.id, "pending entry was deleted, acknowledging");
                    client.ack(&self.stream, group, &entry.id).await?;
                }
                Some(found) if found.id == entry.id => {
                    debug!(
                        stream = self.stream,
                        id = entry.id,
                        deliveries = entry.deliveries,
                        "redelivering pending entry"
                    );
                    return Ok(self.to_message(client, found));
                }
                _ => debug!(stream = self.stream, id = entry.id, "pending entry no longer held"),
            }
        }

        Ok(Message::empty())
    }

    fn exceeds_deadline(&self, deliveries: u64) -> bool {
        self.deadline > 0 && deliveries >= self.deadline && !self.stream.ends_with(DEAD_LETTER_SUFFIX)
    }

    async fn dead_letter(&self, client: &Arc<dyn StreamClient>, group: &str, id: &str) -> Result<(), QueueError> {
        let target = dead_letter_stream(&self.stream);

        let entries = client.range(&self.stream, id, id, 1).await?;
        if let Some(entry) = entries.into_iter().next() {
            let mut fields: Vec<(String, Vec<u8>)> = entry.fields.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));

            client.add(&target, &fields, None).await.map_err(|err| {
                error!(error = err.to_string(), stream = self.stream, id, "failure to dead-letter entry");
                QueueError::PublishingToDeadLetterError(target.clone())
            })?;
        }

        client.ack(&self.stream, group, id).await?;

        error!(
            stream = self.stream,
            id,
            dead_letter = target,
            deadline = self.deadline,
            "delivery budget exhausted, entry dead-lettered"
        );
        Ok(())
    }

    fn claim_stale(&mut self, client: &Arc<dyn StreamClient>, group: &str) {
        let interval = self.idle_timeout.max(CLAIM_INTERVAL_FLOOR);
        if matches!(self.cursor.last_claim, Some(at) if at.elapsed() < interval) {
            return;
        }
        self.cursor.last_claim = Some(Instant::now());

        let client = client.clone();
        let (stream, group, consumer) = (self.stream.clone(), group.to_owned(), self.consumer.clone());
        let (idle_timeout, batch) = (self.idle_timeout, self.batch);

        tokio::spawn(async move {
            match client.claim(&stream, &group, &consumer, idle_timeout, batch).await {
                Ok(()) => debug!(stream, group, consumer, "stale entries claimed"),
                Err(err) => warn!(error = err.to_string(), stream, group, "failure to claim stale entries"),
            }
        });
    }

    async fn poll_broadcast(&mut self, client: &Arc<dyn StreamClient>) -> Result<Message, QueueError> {
        let after = match &self.cursor.last_message_id {
            Some(id) => id.clone(),
            None => {
                let last = client.last_id(&self.stream).await?.unwrap_or_else(|| "0".to_owned());
                self.cursor.last_message_id = Some(last.clone());
                last
            }
        };

        let entries = client.read(&self.stream, &after, 1).await?;

        match entries.into_iter().next() {
            Some(entry) => {
                self.cursor.last_message_id = Some(entry.id.clone());
                Ok(self.to_message(client, entry))
            }
            None => Ok(Message::empty()),
        }
    }

    fn to_message(&self, client: &Arc<dyn StreamClient>, entry: StreamEntry) -> Message {
        let tags = entry
            .fields
            .get(TAGS_FIELD)
            .and_then(|tags| std::str::from_utf8(tags).ok());
        let payload = entry.fields.get(PAYLOAD_FIELD).cloned().unwrap_or_default();
        let timestamp = entry
            .id
            .parse::<MessageId>()
            .map(|id| UNIX_EPOCH + Duration::from_millis(id.major))
            .unwrap_or_else(|_| SystemTime::now());

        let msg = Message::new(&entry.id, &self.topic, tags, payload).with_timestamp(timestamp);

        let Some(group) = &self.group else {
            return msg;
        };

        let client = client.clone();
        let (stream, group, id) = (self.stream.clone(), group.clone(), entry.id);

        msg.with_ack(move || {
            let client = client.clone();
            let (stream, group, id) = (stream.clone(), group.clone(), id.clone());
            async move {
                match client.ack(&stream, &group, &id).await {
                    Ok(pending) => {
                        if !pending {
                            debug!(stream, id, "entry was not pending when acknowledged");
                        }
                        true
                    }
                    Err(err) => {
                        error!(error = err.to_string(), stream, id, "failure to acknowledge entry");
                        false
                    }
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_stream::client::{MockStreamClient, PendingEntry};
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio_util::sync::CancellationToken;

    fn poller() -> StreamPoller {
        let mut poller = StreamPoller::new("orders", "orders", Some("workers"), "c1").deadline(3);
        poller.cursor.last_claim = Some(Instant::now());
        poller
    }

    fn entry(id: &str, payload: &str) -> StreamEntry {
        StreamEntry {
            id: id.to_owned(),
            fields: HashMap::from([(PAYLOAD_FIELD.to_owned(), payload.as_bytes().to_vec())]),
        }
    }

    fn pending(id: &str, deliveries: u64) -> PendingEntry {
        PendingEntry {
            id: id.to_owned(),
            consumer: "c1".to_owned(),
            idle: Duration::from_secs(60),
            deliveries,
        }
    }

    fn no_new_entries(mock: &mut MockStreamClient) {
        mock.expect_read_group()
            .withf(|_, _, _, start, _| start == ">")
            .returning(|_, _, _, _, _| Ok(vec![]));
    }

    #[tokio::test]
    async fn entry_at_deadline_is_dead_lettered() {
        let mut mock = MockStreamClient::new();
        no_new_entries(&mut mock);
        mock.expect_pending()
            .times(1)
            .returning(|_, _, _, _, _, _| Ok(vec![pending("1-0", 3)]));
        mock.expect_range()
            .withf(|stream, start, end, _| stream == "orders" && start == "1-0" && end == "1-0")
            .times(1)
            .returning(|_, _, _, _| Ok(vec![entry("1-0", "A")]));
        mock.expect_add()
            .withf(|stream, fields, _| {
                stream == "orders:DEAD!" && fields == [(PAYLOAD_FIELD.to_owned(), b"A".to_vec())]
            })
            .times(1)
            .returning(|_, _, _| Ok("9-0".to_owned()));
        mock.expect_ack()
            .withf(|stream, group, id| stream == "orders" && group == "workers" && id == "1-0")
            .times(1)
            .returning(|_, _, _| Ok(true));

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = poller();
        poller.cursor.processing_pending = true;

        let msg = poller.poll(&client).await.unwrap();
        assert!(msg.is_empty());
        assert_eq!(poller.cursor().pending_cursor.as_deref(), Some("1-0"));
    }

    #[tokio::test]
    async fn entry_below_deadline_is_redelivered() {
        let mut mock = MockStreamClient::new();
        mock.expect_pending()
            .withf(|_, _, consumer, start, _, _| consumer == "c1" && start == "-")
            .times(1)
            .returning(|_, _, _, _, _, _| Ok(vec![pending("7-0", 2)]));
        mock.expect_read_group()
            .withf(|_, _, _, start, count| *start == format!("6-{}", u64::MAX) && *count == 1)
            .times(1)
            .returning(|_, _, _, _, _| Ok(vec![entry("7-0", "A")]));
        mock.expect_add().never();

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = poller();
        poller.cursor.processing_pending = true;

        let msg = poller.poll(&client).await.unwrap();
        assert_eq!(msg.id(), "7-0");
        assert_eq!(msg.payload(), b"A");
        assert!(!poller.cursor().processing_pending);
    }

    #[tokio::test]
    async fn dead_letter_stream_is_never_dead_lettered() {
        let poller = StreamPoller::new("orders:DEAD!", "orders", Some("workers"), "c1").deadline(1);
        assert!(!poller.exceeds_deadline(100));

        let disabled = StreamPoller::new("orders", "orders", Some("workers"), "c1").deadline(0);
        assert!(!disabled.exceeds_deadline(u64::MAX));
    }

    #[tokio::test]
    async fn empty_cycles_alternate_into_backlog() {
        let mut mock = MockStreamClient::new();
        no_new_entries(&mut mock);
        mock.expect_pending()
            .times(3)
            .returning(|_, _, _, _, _, _| Ok(vec![]));

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = poller();

        for _ in 0..4 {
            assert!(poller.poll(&client).await.unwrap().is_empty());
            assert!(poller.cursor().processing_pending);
        }
    }

    #[tokio::test]
    async fn pending_cursor_advances_and_resets() {
        let mut mock = MockStreamClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        mock.expect_pending().returning(move |_, _, _, start, _, _| {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert_eq!(start, "-");
                    Ok(vec![pending("4-2", 1)])
                }
                1 => {
                    assert_eq!(start, "4-3");
                    Ok(vec![])
                }
                _ => {
                    assert_eq!(start, "-");
                    Ok(vec![])
                }
            }
        });
        mock.expect_read_group()
            .withf(|_, _, _, start, _| start == "4-1")
            .returning(|_, _, _, _, _| Ok(vec![entry("4-2", "B")]));
        no_new_entries(&mut mock);

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = poller();

        for expected in [Some("4-2"), None, None] {
            poller.cursor.processing_pending = true;
            poller.poll(&client).await.unwrap();
            assert_eq!(poller.cursor().pending_cursor.as_deref(), expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deleted_pending_entry_is_acknowledged() {
        let mut mock = MockStreamClient::new();
        no_new_entries(&mut mock);
        mock.expect_pending()
            .returning(|_, _, _, _, _, _| Ok(vec![pending("3-0", 1)]));
        mock.expect_read_group()
            .withf(|_, _, _, start, _| start != ">")
            .returning(|_, _, _, _, _| {
                Ok(vec![StreamEntry {
                    id: "3-0".to_owned(),
                    fields: HashMap::new(),
                }])
            });
        mock.expect_ack().times(1).returning(|_, _, _| Ok(true));

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = poller();
        poller.cursor.processing_pending = true;

        assert!(poller.poll(&client).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_at_most_once_per_interval() {
        let mut mock = MockStreamClient::new();
        let claims = Arc::new(AtomicUsize::new(0));
        let counted = claims.clone();
        mock.expect_claim()
            .withf(|stream, group, consumer, min_idle, _| {
                stream == "orders" && group == "workers" && consumer == "c1" && *min_idle == Duration::from_secs(30)
            })
            .returning(move |_, _, _, _, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        no_new_entries(&mut mock);
        mock.expect_pending().returning(|_, _, _, _, _, _| Ok(vec![]));

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = StreamPoller::new("orders", "orders", Some("workers"), "c1");

        poller.poll(&client).await.unwrap();
        poller.poll(&client).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(claims.load(Ordering::SeqCst), 1);

        poller.cursor.last_claim = Instant::now().checked_sub(CLAIM_INTERVAL_FLOOR + Duration::from_secs(1));
        poller.poll(&client).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(claims.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_reads_after_last_entry() {
        let mut mock = MockStreamClient::new();
        mock.expect_last_id()
            .times(1)
            .returning(|_| Ok(Some("5-0".to_owned())));
        mock.expect_read()
            .withf(|_, after, _| after == "5-0")
            .times(1)
            .returning(|_, _, _| Ok(vec![entry("6-0", "C")]));
        mock.expect_read()
            .withf(|_, after, _| after == "6-0")
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        mock.expect_ack().never();

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut poller = StreamPoller::new("orders", "orders", None, "c1");

        let msg = poller.poll(&client).await.unwrap();
        assert_eq!(msg.id(), "6-0");
        assert!(msg.acknowledge(&CancellationToken::new()).await);
        assert!(poller.poll(&client).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_carries_entry_fields() {
        let mut mock = MockStreamClient::new();
        mock.expect_ack()
            .withf(|stream, group, id| stream == "orders" && group == "workers" && id == "1526919030474-55")
            .times(1)
            .returning(|_, _, _| Ok(true));

        let client: Arc<dyn StreamClient> = Arc::new(mock);
        let mut raw = entry("1526919030474-55", "D");
        raw.fields.insert(TAGS_FIELD.to_owned(), b"red".to_vec());

        let msg = poller().to_message(&client, raw);
        assert_eq!(msg.topic(), "orders");
        assert_eq!(msg.tags(), Some("red"));
        assert_eq!(
            msg.timestamp(),
            UNIX_EPOCH + Duration::from_millis(1_526_919_030_474)
        );

        assert!(msg.acknowledge(&CancellationToken::new()).await);
        assert!(msg.acknowledge(&CancellationToken::new()).await);
    }
}
