// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Consumer
//!
//! Turns a delivery into a [`Message`], hands it to the subscriber registered
//! for the consumer's `(topic, tags)` and settles it with the broker:
//!
//! | outcome                          | settlement              |
//! |----------------------------------|-------------------------|
//! | handled                          | ack, unless already acked |
//! | failed and not acked             | nack without requeue    |
//! | filtered by tags                 | ack                     |
//! | subscriber missing/unsubscribed  | nack with requeue       |

use super::{otel, publisher::AMQP_HEADERS_TAGS};
use crate::{
    message::Message,
    registry::SubscriberRegistry,
    subscriber::{Dispatch, SubscriptionKey},
};
use futures_util::FutureExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::AMQPValue,
};
use opentelemetry::trace::{Span, Status};
use std::{
    borrow::Cow,
    time::{Duration, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) fn tags(props: &AMQPProperties) -> Option<String> {
    let headers = props.headers().as_ref()?;
    match headers.inner().get(AMQP_HEADERS_TAGS)? {
        AMQPValue::LongString(tags) => std::str::from_utf8(tags.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(tags) => Some(tags.as_str().to_owned()),
        _ => None,
    }
}

/// Builds the message of a delivery; `auto_ack` deliveries carry no ack callback.
pub(crate) fn to_message(delivery: &Delivery, auto_ack: bool) -> Message {
    let props = &delivery.properties;
    let id = props
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_owned())
        .unwrap_or_else(|| delivery.delivery_tag.to_string());
    let tags = tags(props);

    let mut msg = Message::new(
        &id,
        delivery.routing_key.as_str(),
        tags.as_deref(),
        delivery.data.clone(),
    );

    if let Some(timestamp) = props.timestamp() {
        msg = msg.with_timestamp(UNIX_EPOCH + Duration::from_secs(*timestamp));
    }

    if auto_ack {
        return msg;
    }

    let acker = delivery.acker.clone();
    msg.with_ack(move || {
        let acker = acker.clone();
        async move {
            match acker.ack(BasicAckOptions { multiple: false }).await {
                Ok(()) => true,
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    false
                }
            }
        }
        .boxed()
    })
}

async fn nack(acker: &Acker, requeue: bool) {
    if let Err(err) = acker
        .nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
    {
        error!(error = err.to_string(), requeue, "error whiling nack msg");
    }
}

/// What the consumer does with a delivery once its subscriber has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    /// Nack without requeue, so the broker dead letters it.
    Reject,
    Requeue,
    /// The handler already acked the delivery.
    Settled,
}

pub(crate) fn settlement(outcome: Dispatch, acked: bool) -> Settlement {
    match outcome {
        Dispatch::Handled | Dispatch::Filtered | Dispatch::Empty => Settlement::Ack,
        Dispatch::Failed if acked => Settlement::Settled,
        Dispatch::Failed => Settlement::Reject,
        Dispatch::Unsubscribed => Settlement::Requeue,
    }
}

/// Dispatches a delivery to the subscriber registered under `key` and
/// settles it with the broker.
///
/// # Parameters
/// * `registry` - Subscribers of the queue
/// * `key` - Subscription the consumer was started for
/// * `delivery` - Delivery received from the broker
/// * `auto_ack` - Whether the broker already considers the delivery acked
pub(crate) async fn consume(
    registry: &SubscriberRegistry,
    key: &SubscriptionKey,
    delivery: Delivery,
    auto_ack: bool,
) {
    let (_ctx, mut span) = otel::new_span(&delivery.properties, &key.topic);
    let msg = to_message(&delivery, auto_ack);

    debug!(
        topic = msg.topic(),
        id = msg.id(),
        exchange = delivery.exchange.as_str(),
        "received"
    );

    let outcome = match registry.get(key) {
        Some(subscriber) => subscriber.dispatch(msg.clone()).await,
        None => Dispatch::Unsubscribed,
    };

    if auto_ack {
        span.set_status(match outcome {
            Dispatch::Failed => Status::error("handler failure"),
            _ => Status::Ok,
        });
        return;
    }

    match settlement(outcome, msg.is_acknowledged()) {
        Settlement::Ack => {
            if !msg.acknowledge(&CancellationToken::new()).await {
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return;
            }
            span.set_status(Status::Ok);
        }
        Settlement::Reject => {
            warn!(topic = msg.topic(), id = msg.id(), "rejecting message to dead letter");
            nack(&delivery.acker, false).await;
            span.set_status(Status::error("handler failure"));
        }
        Settlement::Settled => {
            span.set_status(Status::error("handler failure"));
        }
        Settlement::Requeue => {
            debug!(topic = msg.topic(), id = msg.id(), "no active subscriber, requeuing");
            nack(&delivery.acker, true).await;
        }
    }
}
