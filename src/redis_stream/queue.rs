// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redis Stream Queue
//!
//! [`Queue`] over Redis Streams. Producing appends an entry to `{prefix}{topic}`;
//! each subscriber gets a polling task that runs a [`StreamPoller`] against
//! the connection owned by the reconnect supervisor.

use super::{
    client::{StreamClient, StreamClientFactory},
    poller::StreamPoller,
    redis::RedisClientFactory,
    PAYLOAD_FIELD, PROPS_FIELD, TAGS_FIELD,
};
use crate::{
    errors::QueueError,
    handler::MessageHandler,
    options::{EnqueueOptions, SubscribeOptions},
    queue::{validate_topic, Queue, QueueBase},
    settings::{client_id, RedisStreamSettings},
    subscriber::{Binding, Dispatch, Subscriber},
    supervisor::{Connector, DisconnectNotifier, ReconnectSupervisor},
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct StreamConnector {
    settings: RedisStreamSettings,
    consumer: String,
    factory: Arc<dyn StreamClientFactory>,
}

impl StreamConnector {
    pub fn stream(&self, topic: &str) -> String {
        format!("{}{}", self.settings.prefix.as_deref().unwrap_or_default(), topic)
    }

    /// Consumer name of this process inside the consumer group.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Consumer group of `subscriber`, if the queue is grouped.
    ///
    /// Subscriptions with a tag expression get a group of their own, so
    /// acknowledging an entry filtered out by one subscription does not
    /// hide it from another subscription on the same topic.
    pub fn group(&self, subscriber: &Subscriber) -> Option<String> {
        let group = self.settings.group.as_deref()?;
        Some(subscription_group(group, subscriber.tags()))
    }

    fn poller(&self, subscriber: &Subscriber) -> StreamPoller {
        StreamPoller::new(
            &self.stream(subscriber.topic()),
            subscriber.topic(),
            self.group(subscriber).as_deref(),
            &self.consumer,
        )
        .idle_timeout(self.settings.idle_timeout())
        .deadline(self.settings.deadline)
        .batch(self.settings.batch_size)
    }
}

#[async_trait]
impl Connector for StreamConnector {
    type Connection = Arc<dyn StreamClient>;

    async fn connect(&self, _notifier: DisconnectNotifier) -> Result<Self::Connection, QueueError> {
        // multiplexed connections report failures through the commands issued on them
        self.factory.create().await
    }

    async fn attach(
        &self,
        supervisor: &Arc<ReconnectSupervisor<Self>>,
        connection: &Self::Connection,
        subscriber: &Arc<Subscriber>,
    ) -> Result<(), QueueError> {
        if let Some(group) = self.group(subscriber) {
            let stream = self.stream(subscriber.topic());
            connection.create_group(&stream, &group, "0").await.map_err(|err| {
                error!(error = err.to_string(), stream, group, "failure to create consumer group");
                err
            })?;
        }

        let started = subscriber.bind_poller(|| {
            tokio::spawn(run_poller(
                Arc::downgrade(supervisor),
                subscriber.clone(),
                self.poller(subscriber),
                self.settings.poll_interval(),
            ))
        });
        if !started {
            debug!(topic = subscriber.topic(), "poller already running");
        }

        Ok(())
    }

    async fn detach(&self, _connection: Option<&Self::Connection>, subscriber: &Subscriber) {
        // the task stops on the subscriber token, the handle is only dropped here
        if let Binding::Polling { .. } = subscriber.take_binding() {
            debug!(topic = subscriber.topic(), "poller released");
        }
    }

    async fn close(&self, _connection: Self::Connection) {}
}

/// Shortest pause of a poller between two empty reads.
const MIN_IDLE: Duration = Duration::from_millis(10);

/// Consumer group of a subscription: `{group}` or `{group}.{tags}`.
pub fn subscription_group(group: &str, tags: Option<&str>) -> String {
    match tags.filter(|t| !t.is_empty() && *t != "*") {
        Some(tags) => format!("{}.{}", group, tags),
        None => group.to_owned(),
    }
}

/// Pause after an empty read: the poll interval, bounded by the
/// subscription timeout and never shorter than [`MIN_IDLE`].
fn idle_pause(poll_interval: Duration, timeout: Duration) -> Duration {
    poll_interval.min(timeout).max(MIN_IDLE)
}

/// Waits for `period` unless `cancel` fires first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

async fn run_poller(
    supervisor: Weak<ReconnectSupervisor<StreamConnector>>,
    subscriber: Arc<Subscriber>,
    mut poller: StreamPoller,
    poll_interval: Duration,
) {
    let cancel = subscriber.cancellation().clone();
    let idle = idle_pause(poll_interval, subscriber.options().timeout);

    debug!(topic = subscriber.topic(), "poller started");

    while !cancel.is_cancelled() {
        let Some(owner) = supervisor.upgrade() else {
            break;
        };

        let session = match owner.ensure_connected(&cancel).await {
            Ok(session) => session,
            Err(QueueError::Cancelled) | Err(QueueError::Disposed(_)) => break,
            Err(err) => {
                warn!(error = err.to_string(), topic = subscriber.topic(), "poller waiting for connection");
                drop(owner);
                if !pause(&cancel, idle).await {
                    break;
                }
                continue;
            }
        };

        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = poller.poll(&session.connection) => polled,
        };

        let msg = match polled {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = err.to_string(), topic = subscriber.topic(), "failure to read stream");
                if err.is_transient() {
                    owner.connection_lost(session.epoch);
                }
                drop(owner);
                if !pause(&cancel, idle).await {
                    break;
                }
                continue;
            }
        };
        drop(owner);

        if msg.is_empty() {
            if !pause(&cancel, idle).await {
                break;
            }
            continue;
        }

        match subscriber.dispatch(msg.clone()).await {
            Dispatch::Filtered if poller.is_grouped() => {
                msg.acknowledge(&cancel).await;
            }
            Dispatch::Unsubscribed => break,
            _ => {}
        }
    }

    debug!(topic = subscriber.topic(), "poller stopped");
}

/// Durable-log queue backed by Redis Streams.
pub struct RedisStreamQueue {
    base: QueueBase<StreamConnector>,
    max_length: Option<usize>,
}

impl RedisStreamQueue {
    pub fn new(name: &str, settings: RedisStreamSettings) -> Result<RedisStreamQueue, QueueError> {
        let factory = Arc::new(RedisClientFactory::new(settings.clone()));
        RedisStreamQueue::with_factory(name, settings, factory)
    }

    /// Creates the queue over an injected client factory.
    pub fn with_factory(
        name: &str,
        settings: RedisStreamSettings,
        factory: Arc<dyn StreamClientFactory>,
    ) -> Result<RedisStreamQueue, QueueError> {
        settings.validate()?;

        let retry = settings.reconnect.clone();
        let max_length = settings.max_length;
        let connector = StreamConnector {
            consumer: client_id(&settings.client),
            settings,
            factory,
        };

        Ok(RedisStreamQueue {
            base: QueueBase::new(name, connector, retry),
            max_length,
        })
    }

    pub fn base(&self) -> &QueueBase<StreamConnector> {
        &self.base
    }

    fn connector(&self) -> &StreamConnector {
        self.base.supervisor().connector()
    }
}

#[async_trait]
impl Queue for RedisStreamQueue {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn produce(
        &self,
        topic: &str,
        tags: Option<&str>,
        payload: &[u8],
        options: Option<&EnqueueOptions>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        validate_topic(topic)?;

        let mut fields = vec![(PAYLOAD_FIELD.to_owned(), payload.to_vec())];
        if let Some(tags) = tags {
            fields.push((TAGS_FIELD.to_owned(), tags.as_bytes().to_vec()));
        }
        if let Some(options) = options.filter(|o| !o.properties.is_empty()) {
            let props = serde_json::to_vec(&options.properties)
                .map_err(|err| QueueError::InvalidArgument(err.to_string()))?;
            fields.push((PROPS_FIELD.to_owned(), props));
        }

        let session = self.base.session(cancel).await?;
        let stream = self.connector().stream(topic);

        let added = tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            added = session.connection.add(&stream, &fields, self.max_length) => added,
        };

        match added {
            Ok(id) => {
                debug!(stream, id, "message produced");
                Ok(Some(id))
            }
            Err(err) => {
                error!(error = err.to_string(), stream, "failure to produce message");
                self.base.report(&session, &err);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        tags: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        options: Option<SubscribeOptions>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Subscriber>, QueueError> {
        self.base.subscribe(topic, tags, handler, options, cancel).await
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) {
        self.base.unsubscribe(subscriber).await
    }

    async fn dispose(&self) {
        self.base.dispose().await
    }
}
