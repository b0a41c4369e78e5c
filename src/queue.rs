// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Contract
//!
//! The broker-agnostic contract every backend implements, and [`QueueBase`],
//! the subscription lifecycle shared by all of them.

use crate::{
    errors::QueueError,
    handler::MessageHandler,
    options::{EnqueueOptions, SubscribeOptions},
    registry::SubscriberRegistry,
    settings::ReconnectSettings,
    subscriber::{Subscriber, SubscriptionKey},
    supervisor::{Connector, ReconnectSupervisor, Session},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Produce/consume contract shared by every backend.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Name the queue was registered under.
    fn name(&self) -> &str;

    /// Publishes one message, connecting first when needed.
    ///
    /// # Parameters
    /// * `topic` - Destination topic, must not be empty
    /// * `tags` - Tags subscribers filter on
    /// * `payload` - Message body
    /// * `options` - Per-message options
    /// * `cancel` - Aborts the connection wait
    ///
    /// # Returns
    /// * `Result<Option<String>, QueueError>` - The broker-assigned identifier
    ///   when the backend has one
    async fn produce(
        &self,
        topic: &str,
        tags: Option<&str>,
        payload: &[u8],
        options: Option<&EnqueueOptions>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError>;

    /// Registers `handler` for `(topic, tags)` and starts consuming.
    ///
    /// Subscribing again with the same pair replaces the previous subscriber.
    ///
    /// # Parameters
    /// * `topic` - Topic to consume, must not be empty
    /// * `tags` - Tag expression (`a||b`), `*` or `None` for every message
    /// * `handler` - Called once per delivered message
    /// * `options` - Subscription options, defaults when `None`
    /// * `cancel` - Aborts the connection wait
    ///
    /// # Returns
    /// * `Result<Arc<Subscriber>, QueueError>` - The registered subscriber,
    ///   to pass to `unsubscribe`
    async fn subscribe(
        &self,
        topic: &str,
        tags: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        options: Option<SubscribeOptions>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Subscriber>, QueueError>;

    /// Removes the subscription and releases its broker resources.
    /// Unsubscribing twice is a no-op.
    async fn unsubscribe(&self, subscriber: &Subscriber);

    /// Releases every subscriber and the broker connection. Safe to call repeatedly.
    async fn dispose(&self);
}

/// Subscription lifecycle shared by the backends, on top of the supervisor.
pub struct QueueBase<C: Connector> {
    supervisor: Arc<ReconnectSupervisor<C>>,
}

impl<C: Connector> QueueBase<C> {
    pub fn new(name: &str, connector: C, retry: ReconnectSettings) -> QueueBase<C> {
        QueueBase {
            supervisor: ReconnectSupervisor::new(name, connector, retry),
        }
    }

    /// Creates the base over a registry shared with `connector`.
    pub fn with_registry(
        name: &str,
        connector: C,
        retry: ReconnectSettings,
        registry: Arc<SubscriberRegistry>,
    ) -> QueueBase<C> {
        QueueBase {
            supervisor: ReconnectSupervisor::with_registry(name, connector, retry, registry),
        }
    }

    pub fn name(&self) -> &str {
        self.supervisor.name()
    }

    pub fn supervisor(&self) -> &Arc<ReconnectSupervisor<C>> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.supervisor.registry()
    }

    /// Live session for a produce or subscribe call.
    pub async fn session(&self, cancel: &CancellationToken) -> Result<Session<C::Connection>, QueueError> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        self.supervisor.ensure_connected(cancel).await
    }

    /// Reports a transient failure seen while using `session`.
    pub fn report(&self, session: &Session<C::Connection>, err: &QueueError) {
        if err.is_transient() {
            self.supervisor.connection_lost(session.epoch);
        }
    }

    /// Registers the subscriber before attaching it to the broker, so a
    /// reconnect that happens meanwhile resubscribes it. A failed attach
    /// removes the registration again.
    pub async fn subscribe(
        &self,
        topic: &str,
        tags: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        options: Option<SubscribeOptions>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Subscriber>, QueueError> {
        validate_topic(topic)?;

        let session = self.session(cancel).await?;
        let registry = self.registry();

        let subscriber = Arc::new(Subscriber::new(
            registry.next_seq(),
            SubscriptionKey::new(topic, tags),
            handler,
            options.unwrap_or_default(),
            self.supervisor.shutdown_token(),
        ));

        // registered before the broker sees it, so a concurrent recovery restores it
        if let Some(previous) = registry.insert(subscriber.clone()) {
            debug!(queue = self.name(), topic, "replacing subscriber");
            self.release(&previous).await;
        }

        let attached = self
            .supervisor
            .connector()
            .attach(&self.supervisor, &session.connection, &subscriber)
            .await;

        match attached {
            Ok(()) => {
                debug!(queue = self.name(), topic, "subscribed");
                Ok(subscriber)
            }
            Err(err) => {
                registry.remove(&subscriber);
                subscriber.mark_unsubscribed();
                self.report(&session, &err);
                Err(err)
            }
        }
    }

    pub async fn unsubscribe(&self, subscriber: &Subscriber) {
        if subscriber.is_unsubscribed() {
            debug!(queue = self.name(), topic = subscriber.topic(), "already unsubscribed");
            return;
        }

        self.registry().remove(subscriber);
        self.release(subscriber).await;
    }

    async fn release(&self, subscriber: &Subscriber) {
        if !subscriber.mark_unsubscribed() {
            return;
        }

        let session = self.supervisor.current();
        self.supervisor
            .connector()
            .detach(session.as_ref().map(|s| &s.connection), subscriber)
            .await;

        debug!(queue = self.name(), topic = subscriber.topic(), "unsubscribed");
    }

    /// Unsubscribes everything and closes the connection.
    pub async fn dispose(&self) {
        self.supervisor.dispose().await
    }
}

impl<C: Connector> Drop for QueueBase<C> {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

pub(crate) fn validate_topic(topic: &str) -> Result<(), QueueError> {
    if topic.trim().is_empty() {
        return Err(QueueError::InvalidArgument("topic must not be empty".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::handler_fn, message::Message, supervisor::tests::CountingConnector,
    };
    use std::sync::atomic::Ordering;

    fn base() -> QueueBase<CountingConnector> {
        QueueBase::new("test", CountingConnector::default(), ReconnectSettings::default())
    }

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(|_msg: Message| async move { Ok(()) }))
    }

    #[tokio::test]
    async fn unsubscribe_twice_releases_once() {
        let base = base();
        let cancel = CancellationToken::new();
        let subscriber = base.subscribe("orders", None, handler(), None, &cancel).await.unwrap();

        base.unsubscribe(&subscriber).await;
        base.unsubscribe(&subscriber).await;

        assert!(subscriber.is_unsubscribed());
        assert!(base.registry().is_empty());
        assert_eq!(base.supervisor().connector().detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscriber() {
        let base = base();
        let cancel = CancellationToken::new();
        let first = base.subscribe("orders", Some("red"), handler(), None, &cancel).await.unwrap();
        let second = base.subscribe("orders", Some("red"), handler(), None, &cancel).await.unwrap();

        assert!(first.is_unsubscribed());
        assert!(!second.is_unsubscribed());
        assert_eq!(base.registry().len(), 1);
        assert_eq!(base.supervisor().connector().detaches.load(Ordering::SeqCst), 1);

        // releasing the replaced handle again does not touch the live one
        base.unsubscribe(&first).await;
        assert_eq!(base.registry().len(), 1);
    }

    #[tokio::test]
    async fn failed_attach_rolls_back_registration() {
        let base = base();
        *base.supervisor().connector().failing_topic.lock().unwrap() = Some("orders".into());

        let err = base
            .subscribe("orders", None, handler(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, QueueError::SubscribeError("orders".into()));
        assert!(base.registry().is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_topic_and_cancelled_calls() {
        let base = base();
        let err = base
            .subscribe(" ", None, handler(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = base.subscribe("orders", None, handler(), None, &cancel).await.unwrap_err();
        assert_eq!(err, QueueError::Cancelled);
        assert_eq!(base.supervisor().connector().connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connection_failure_propagates_to_caller() {
        let base = base();
        base.supervisor().connector().failing.store(true, Ordering::SeqCst);

        let err = base
            .subscribe("orders", None, handler(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(base.registry().is_empty());
    }
}
