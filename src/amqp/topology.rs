// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Topology
//!
//! Declares the topic exchange every message is published to, the queue
//! behind each subscription and, for grouped subscriptions, its dead-letter
//! queue. Queues are bound to the exchange with the topic as routing key.

use crate::errors::QueueError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Exchanges with this prefix are predeclared by the broker and may only be
/// declared passively.
const RESERVED_EXCHANGE_PREFIX: &str = "amq.";

/// Queue backing one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    /// Empty for a server-named queue.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dlq_name: Option<String>,
    pub ttl: Option<i32>,
    pub max_length: Option<i32>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Exclusive, auto-deleted queue named by the broker.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max_length: i32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }

    /// Declaration arguments: dead-lettering to the default exchange, TTL and length limit.
    pub fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(dlq_name) = &self.dlq_name {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq_name.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max_length) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        args
    }
}

/// Name of the shared queue of a grouped subscription: `{group}.{topic}[.{tags}]`.
pub fn subscription_queue_name(group: &str, topic: &str, tags: Option<&str>) -> String {
    match tags.filter(|t| !t.is_empty()) {
        Some(tags) => format!("{}.{}.{}", group, topic, tags),
        None => format!("{}.{}", group, topic),
    }
}

/// Declares the durable topic exchange messages are published to. Reserved
/// `amq.*` exchanges are declared passively.
///
/// # Parameters
/// * `channel` - Open channel
/// * `name` - Exchange name
///
/// # Returns
/// * `Result<(), QueueError>` - `DeclareExchangeError` when the broker refuses it
pub async fn install_exchange(channel: &Channel, name: &str) -> Result<(), QueueError> {
    debug!("creating exchange: {}", name);

    match channel
        .exchange_declare(
            name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: name.starts_with(RESERVED_EXCHANGE_PREFIX),
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the exchange");
            Err(QueueError::DeclareExchangeError(err.to_string()))
        }
        _ => {
            debug!("exchange: {} was created", name);
            Ok(())
        }
    }
}

/// Declares the queue and its dead-letter queue.
///
/// # Parameters
/// * `channel` - Open channel
/// * `def` - Queue to declare
///
/// # Returns
/// * `Result<String, QueueError>` - The queue name, which the broker picks
///   for server-named queues
pub async fn install_queue(channel: &Channel, def: &QueueDefinition) -> Result<String, QueueError> {
    if let Some(dlq_name) = &def.dlq_name {
        declare_dlq(channel, def, dlq_name).await?;
    }

    debug!("creating queue: {}", def.name);

    match channel
        .queue_declare(&def.name, def.declare_options(), FieldTable::from(def.arguments()))
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "failure to declare queue");
            Err(QueueError::DeclareQueueError(def.name.clone()))
        }
        Ok(queue) => {
            let name = queue.name().as_str().to_owned();
            debug!("queue: {} was created", name);
            Ok(name)
        }
    }
}

async fn declare_dlq(channel: &Channel, def: &QueueDefinition, dlq_name: &str) -> Result<(), QueueError> {
    match channel
        .queue_declare(dlq_name, def.declare_options(), FieldTable::default())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to declare dead letter queue");
            Err(QueueError::DeclareQueueError(dlq_name.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Binds `queue` to `exchange` with a topic routing key.
///
/// # Parameters
/// * `channel` - Open channel
/// * `queue` - Queue to bind
/// * `exchange` - Exchange the queue receives from
/// * `routing_key` - Topic of the subscription
pub async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), QueueError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue, exchange, routing_key
    );

    match channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(QueueError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_queue_names_include_tags() {
        assert_eq!(subscription_queue_name("workers", "orders", None), "workers.orders");
        assert_eq!(subscription_queue_name("workers", "orders", Some("")), "workers.orders");
        assert_eq!(
            subscription_queue_name("workers", "orders", Some("red")),
            "workers.orders.red"
        );
    }

    #[test]
    fn dead_letter_arguments_route_to_dlq() {
        let def = QueueDefinition::new("workers.orders").durable().with_dlq().ttl(1000);
        let args = def.arguments();

        assert_eq!(def.dlq_name.as_deref(), Some("workers.orders-dlq"));
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("workers.orders-dlq")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(1000))
        );
        assert!(!args.contains_key(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)));
    }

    #[test]
    fn server_named_queues_are_exclusive() {
        let def = QueueDefinition::server_named();
        assert!(def.name.is_empty());
        assert!(def.exclusive && def.auto_delete && !def.durable);
        assert!(def.arguments().is_empty());
    }
}
