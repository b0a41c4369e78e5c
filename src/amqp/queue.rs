// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Queue
//!
//! [`Queue`] over RabbitMQ. Messages are published to one topic exchange;
//! every subscription consumes its own queue bound with the topic as routing
//! key, and deliveries are pushed to a consumer delegate.

use super::{
    channel::{self, classify, new_amqp_channel, AmqpLink},
    consumer::consume,
    publisher::publish,
    topology::{bind_queue, install_exchange, install_queue, subscription_queue_name, QueueDefinition},
};
use crate::{
    errors::QueueError,
    handler::MessageHandler,
    options::{EnqueueOptions, Reliability, SubscribeOptions},
    queue::{validate_topic, Queue, QueueBase},
    settings::{client_id, AmqpSettings},
    subscriber::{Binding, Subscriber},
    supervisor::{Connector, DisconnectNotifier, ReconnectSupervisor},
};
use async_trait::async_trait;
use lapin::{
    message::DeliveryResult,
    options::{BasicCancelOptions, BasicConsumeOptions},
    types::FieldTable,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct AmqpConnector {
    settings: AmqpSettings,
    client: String,
}

impl AmqpConnector {
    /// Queue declared for `subscriber`.
    ///
    /// Grouped subscriptions share a durable queue named after the group,
    /// topic and tags, with a `-dlq` when dead lettering is on. Otherwise the
    /// broker names an exclusive queue. The TTL and length limit of the
    /// settings apply to both.
    pub fn queue_definition(&self, subscriber: &Subscriber) -> QueueDefinition {
        let mut def = match &self.settings.group {
            Some(group) => {
                let def = QueueDefinition::new(&subscription_queue_name(
                    group,
                    subscriber.topic(),
                    subscriber.tags(),
                ))
                .durable();
                if self.settings.dead_letter {
                    def.with_dlq()
                } else {
                    def
                }
            }
            None => QueueDefinition::server_named(),
        };

        if let Some(ttl) = self.settings.queue_ttl_ms {
            def = def.ttl(ttl);
        }
        if let Some(max_length) = self.settings.queue_max_length {
            def = def.max_length(max_length);
        }
        def
    }

    fn consumer_tag(&self, subscriber: &Subscriber) -> String {
        format!("{}.{}", self.client, subscriber.id())
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpLink;

    async fn connect(&self, notifier: DisconnectNotifier) -> Result<AmqpLink, QueueError> {
        let link = new_amqp_channel(&self.settings, &self.client, notifier).await?;

        if let Err(err) = install_exchange(&link.channel, &self.settings.exchange).await {
            channel::close(link).await;
            return Err(err);
        }

        Ok(link)
    }

    async fn attach(
        &self,
        supervisor: &Arc<ReconnectSupervisor<Self>>,
        link: &AmqpLink,
        subscriber: &Arc<Subscriber>,
    ) -> Result<(), QueueError> {
        let def = self.queue_definition(subscriber);
        let queue = install_queue(&link.channel, &def).await?;
        bind_queue(&link.channel, &queue, &self.settings.exchange, subscriber.topic()).await?;

        let auto_ack = subscriber.options().reliability == Reliability::AtMostOnce;
        let consumer_tag = self.consumer_tag(subscriber);

        let consumer = link
            .channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                classify(&err, QueueError::SubscribeError)
            })?;

        let registry = supervisor.registry().clone();
        let key = subscriber.key().clone();

        consumer.set_delegate(move |delivery: DeliveryResult| {
            let registry = registry.clone();
            let key = key.clone();
            async move {
                match delivery {
                    Ok(Some(delivery)) => consume(&registry, &key, delivery, auto_ack).await,
                    Ok(None) => debug!(topic = key.topic, "consumer cancelled"),
                    Err(err) => error!(error = err.to_string(), topic = key.topic, "errors consume msg"),
                }
            }
        });

        debug!(queue, consumer_tag, topic = subscriber.topic(), "consumer created");
        subscriber.bind(Binding::EventDriven { handle: consumer_tag });

        Ok(())
    }

    async fn detach(&self, link: Option<&AmqpLink>, subscriber: &Subscriber) {
        let Binding::EventDriven { handle } = subscriber.take_binding() else {
            return;
        };
        let Some(link) = link else {
            return;
        };

        if let Err(err) = link
            .channel
            .basic_cancel(&handle, BasicCancelOptions::default())
            .await
        {
            warn!(error = err.to_string(), consumer_tag = handle, "failure to cancel consumer");
        }
    }

    async fn close(&self, link: AmqpLink) {
        channel::close(link).await
    }
}

/// Topic-broker queue backed by RabbitMQ.
pub struct AmqpQueue {
    base: QueueBase<AmqpConnector>,
}

impl AmqpQueue {
    /// Creates the queue. Nothing connects until the first produce or
    /// subscribe.
    ///
    /// # Parameters
    /// * `name` - Name of the queue
    /// * `settings` - Broker, exchange and subscription queue settings
    ///
    /// # Returns
    /// * `Result<AmqpQueue, QueueError>` - `Configuration` when the settings are invalid
    pub fn new(name: &str, settings: AmqpSettings) -> Result<AmqpQueue, QueueError> {
        settings.validate()?;

        let retry = settings.reconnect.clone();
        let connector = AmqpConnector {
            client: client_id(&settings.client),
            settings,
        };

        Ok(AmqpQueue {
            base: QueueBase::new(name, connector, retry),
        })
    }

    pub fn base(&self) -> &QueueBase<AmqpConnector> {
        &self.base
    }
}

#[async_trait]
impl Queue for AmqpQueue {
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

        let session = self.base.session(cancel).await?;
        let exchange = &self.base.supervisor().connector().settings.exchange;

        let published = tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            published = publish(&session.connection.channel, exchange, topic, tags, payload, options) => published,
        };

        match published {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::handler_fn, message::Message, subscriber::SubscriptionKey};

    fn subscriber(tags: Option<&str>) -> Subscriber {
        Subscriber::new(
            1,
            SubscriptionKey::new("orders", tags),
            Arc::new(handler_fn(|_msg: Message| async move { Ok(()) })),
            SubscribeOptions::default(),
            &CancellationToken::new(),
        )
    }

    fn connector(settings: AmqpSettings) -> AmqpConnector {
        AmqpConnector {
            client: client_id(&settings.client),
            settings,
        }
    }

    #[test]
    fn grouped_subscriptions_share_durable_queue() {
        let connector = connector(AmqpSettings {
            group: Some("workers".to_owned()),
            ..Default::default()
        });

        let def = connector.queue_definition(&subscriber(Some("red")));
        assert_eq!(def.name, "workers.orders.red");
        assert!(def.durable && !def.exclusive);
        assert_eq!(def.dlq_name.as_deref(), Some("workers.orders.red-dlq"));
    }

    #[test]
    fn dead_letter_queue_can_be_disabled() {
        let connector = connector(AmqpSettings {
            group: Some("workers".to_owned()),
            dead_letter: false,
            ..Default::default()
        });

        assert_eq!(connector.queue_definition(&subscriber(None)).dlq_name, None);
    }

    #[test]
    fn queue_limits_are_declared_from_settings() {
        let limits = AmqpSettings {
            queue_ttl_ms: Some(60_000),
            queue_max_length: Some(1_000),
            ..Default::default()
        };

        let grouped = connector(AmqpSettings {
            group: Some("workers".to_owned()),
            ..limits.clone()
        })
        .queue_definition(&subscriber(None));
        assert_eq!(grouped.ttl, Some(60_000));
        assert_eq!(grouped.max_length, Some(1_000));
        assert_eq!(grouped.arguments().len(), 4);

        let private = connector(limits).queue_definition(&subscriber(None));
        assert!(private.exclusive);
        assert_eq!(private.ttl, Some(60_000));
        assert_eq!(private.max_length, Some(1_000));
        assert_eq!(private.arguments().len(), 2);
    }

    #[test]
    fn ungrouped_subscriptions_get_private_queues() {
        let connector = connector(AmqpSettings::default());
        let sub = subscriber(None);

        assert_eq!(connector.queue_definition(&sub), QueueDefinition::server_named());
        assert!(connector.consumer_tag(&sub).ends_with(sub.id()));
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let err = AmqpQueue::new(
            "events",
            AmqpSettings {
                exchange: String::new(),
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_produce() {
        let queue = AmqpQueue::new(
            "events",
            AmqpSettings {
                server: "127.0.0.1".to_owned(),
                port: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let err = queue
            .produce("orders", None, b"A", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        queue.dispose().await;
    }
}
