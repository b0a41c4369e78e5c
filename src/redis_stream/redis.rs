// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redis Stream Client
//!
//! [`StreamClient`] implementation over a `redis` multiplexed connection.

use super::client::{PendingEntry, StreamClient, StreamClientFactory, StreamEntry};
use crate::{errors::QueueError, settings::RedisStreamSettings};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, IntoConnectionInfo};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Error code returned when a consumer group already exists.
const BUSY_GROUP: &str = "BUSYGROUP";

type RawEntry = (String, Option<HashMap<String, Vec<u8>>>);

/// Opens multiplexed connections from [`RedisStreamSettings`].
pub struct RedisClientFactory {
    settings: RedisStreamSettings,
}

impl RedisClientFactory {
    pub fn new(settings: RedisStreamSettings) -> RedisClientFactory {
        RedisClientFactory { settings }
    }
}

#[async_trait]
impl StreamClientFactory for RedisClientFactory {
    async fn create(&self) -> Result<Arc<dyn StreamClient>, QueueError> {
        let mut info = self
            .settings
            .server
            .as_str()
            .into_connection_info()
            .map_err(|err| QueueError::Configuration(err.to_string()))?;

        if let Some(user_name) = &self.settings.user_name {
            info.redis.username = Some(user_name.clone());
        }
        if let Some(password) = &self.settings.password {
            info.redis.password = Some(password.clone());
        }

        debug!("creating redis connection...");
        let client = redis::Client::open(info).map_err(|err| {
            error!(error = err.to_string(), "invalid redis settings");
            QueueError::Configuration(err.to_string())
        })?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                QueueError::ConnectionError(err.to_string())
            })?;
        debug!("redis connected");

        Ok(Arc::new(RedisStreamClient { conn }))
    }
}

pub struct RedisStreamClient {
    conn: MultiplexedConnection,
}

fn entries(raw: Vec<RawEntry>) -> Vec<StreamEntry> {
    raw.into_iter()
        .map(|(id, fields)| StreamEntry {
            id,
            fields: fields.unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
        max_length: Option<usize>,
    ) -> Result<String, QueueError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_length) = max_length {
            cmd.arg("MAXLEN").arg("~").arg(max_length);
        }
        cmd.arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value.as_slice());
        }

        let mut conn = self.conn.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Err(err) if err.code() == Some(BUSY_GROUP) => Ok(()),
            other => Ok(other?),
        }
    }

    async fn read(&self, stream: &str, after: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, Vec<RawEntry>)>> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(after)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .flatten()
            .flat_map(|(_, raw)| entries(raw))
            .collect())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, Vec<RawEntry>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(start)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .flatten()
            .flat_map(|(_, raw)| entries(raw))
            .collect())
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
        let mut conn = self.conn.clone();
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg(start)
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
            .collect())
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<RawEntry> = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(entries(raw))
    }

    async fn last_id(&self, stream: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<RawEntry> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(raw.into_iter().next().map(|(id, _)| id))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(acked > 0)
    }
}
