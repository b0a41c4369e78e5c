// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Publisher
//!
//! Publishes messages to the topic exchange with the topic as routing key.
//! Tags, user properties and the trace context travel as headers.

use super::{channel::classify, otel};
use crate::{
    errors::QueueError,
    options::{EnqueueOptions, Reliability},
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Header carrying the message tags.
pub const AMQP_HEADERS_TAGS: &str = "x-tags";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Converts a JSON property into the closest AMQP field value.
pub fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(v) => AMQPValue::Boolean(*v),
        serde_json::Value::Number(v) => match v.as_i64() {
            Some(v) => AMQPValue::LongLongInt(v),
            None => AMQPValue::Double(v.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        serde_json::Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(values.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        serde_json::Value::Object(map) => {
            let table: BTreeMap<ShortString, AMQPValue> = map
                .iter()
                .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
                .collect();
            AMQPValue::FieldTable(FieldTable::from(table))
        }
    }
}

/// Headers of a published message: the trace context of `ctx`, the tags
/// and the custom properties of `options`.
pub fn headers(
    ctx: &Context,
    tags: Option<&str>,
    options: Option<&EnqueueOptions>,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject(ctx, &mut btree);

    if let Some(options) = options {
        for (key, value) in &options.properties {
            btree.insert(ShortString::from(key.clone()), amqp_value(value));
        }
    }

    if let Some(tags) = tags {
        btree.insert(
            ShortString::from(AMQP_HEADERS_TAGS),
            AMQPValue::LongString(LongString::from(tags.to_owned())),
        );
    }

    btree
}

/// Message properties derived from the enqueue options.
pub fn properties(message_id: &str, options: Option<&EnqueueOptions>, headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
        .with_message_id(ShortString::from(message_id.to_owned()))
        .with_timestamp(timestamp)
        .with_headers(FieldTable::from(headers));

    let Some(options) = options else {
        return props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    };

    if options.reliability != Reliability::AtMostOnce {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(priority) = options.priority {
        props = props.with_priority(priority);
    }
    if let Some(expiration) = options.expiration {
        props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }

    props
}

/// Publishes `payload` to `exchange` with `topic` as routing key.
///
/// Unless the message is at-most-once, waits for the broker confirmation.
///
/// # Parameters
/// * `channel` - Channel in confirm mode
/// * `exchange` - Topic exchange
/// * `topic` - Routing key
/// * `tags` - Tag header of the message
/// * `payload` - Message body
/// * `options` - Priority, expiry, reliability and custom properties
///
/// # Returns
/// * `Result<String, QueueError>` - The generated message id, or
///   `PublishingError` when the broker nacks the message
pub async fn publish(
    channel: &Channel,
    exchange: &str,
    topic: &str,
    tags: Option<&str>,
    payload: &[u8],
    options: Option<&EnqueueOptions>,
) -> Result<String, QueueError> {
    let message_id = Uuid::new_v4().to_string();
    let headers = headers(&Context::current(), tags, options);
    let props = properties(&message_id, options, headers);

    let confirm = channel
        .basic_publish(
            exchange,
            topic,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            payload,
            props,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), topic, "error publishing message");
            classify(&err, QueueError::PublishingError)
        })?;

    let at_most_once = options.is_some_and(|o| o.reliability == Reliability::AtMostOnce);
    if at_most_once {
        return Ok(message_id);
    }

    let confirmation = confirm.await.map_err(|err| {
        error!(error = err.to_string(), topic, "error waiting publisher confirm");
        classify(&err, QueueError::PublishingError)
    })?;

    if confirmation.is_nack() {
        error!(topic, message_id, "message rejected by the broker");
        return Err(QueueError::PublishingError(topic.to_owned()));
    }

    debug!(topic, message_id, "message published");
    Ok(message_id)
}
