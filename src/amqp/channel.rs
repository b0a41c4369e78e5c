// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens the connection and the single channel an [`AmqpQueue`](super::AmqpQueue)
//! works on. The channel has publisher confirms enabled and a prefetch limit,
//! and connection errors are forwarded to the reconnect supervisor.

use crate::{errors::QueueError, settings::AmqpSettings, supervisor::DisconnectNotifier};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// A connection and the channel opened on it.
#[derive(Clone)]
pub struct AmqpLink {
    pub connection: Arc<Connection>,
    pub channel: Channel,
}

/// Connects to RabbitMQ and opens a channel in confirm mode with the
/// configured prefetch.
///
/// # Parameters
/// * `settings` - Broker address, credentials and prefetch
/// * `connection_name` - Name the broker shows for the connection
/// * `notifier` - Fired when lapin reports an error on the connection, which
///   is how broker-initiated disconnects reach the supervisor
///
/// # Returns
/// * `Result<AmqpLink, QueueError>` - The connection and its channel, or a
///   transient `ConnectionError` when the broker cannot be reached
pub async fn new_amqp_channel(
    settings: &AmqpSettings,
    connection_name: &str,
    notifier: DisconnectNotifier,
) -> Result<AmqpLink, QueueError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(&settings.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(QueueError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    conn.on_error(move |err| {
        error!(error = err.to_string(), epoch = notifier.epoch(), "amqp connection failure");
        notifier.notify();
    });

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(QueueError::ChannelError)
        }
    }?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            QueueError::ChannelError
        })?;

    if settings.prefetch > 0 {
        channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to set prefetch");
                QueueError::ChannelError
            })?;
    }
    debug!("channel created");

    Ok(AmqpLink {
        connection: Arc::new(conn),
        channel,
    })
}

/// Closes the channel and the connection, ignoring errors from an already dead link.
pub async fn close(link: AmqpLink) {
    if let Err(err) = link.channel.close(200, "closing").await {
        debug!(error = err.to_string(), "channel already closed");
    }
    if let Err(err) = link.connection.close(200, "closing").await {
        debug!(error = err.to_string(), "connection already closed");
    }
}

/// Maps a lapin error, keeping connection-level failures transient.
///
/// # Parameters
/// * `err` - Error returned by lapin
/// * `fallback` - Builds the error for failures of the operation itself
pub fn classify(err: &lapin::Error, fallback: impl FnOnce(String) -> QueueError) -> QueueError {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => QueueError::ConnectionError(err.to_string()),
        _ => fallback(err.to_string()),
    }
}
