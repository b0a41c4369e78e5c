// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Provider
//!
//! Named queues built lazily from a settings document:
//!
//! ```json
//! {
//!   "orders": { "kind": "redis_stream", "server": "redis://127.0.0.1:6379", "group": "workers" },
//!   "events": { "kind": "amqp", "exchange": "events" },
//!   "telemetry": { "kind": "mqtt", "server": "broker.local" }
//! }
//! ```

use crate::{
    amqp::AmqpQueue,
    errors::QueueError,
    mqtt::MqttQueue,
    queue::Queue,
    redis_stream::RedisStreamQueue,
    settings::QueueSettings,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, error};

pub struct QueueProvider {
    settings: HashMap<String, QueueSettings>,
    queues: Mutex<HashMap<String, Arc<dyn Queue>>>,
    disposed: AtomicBool,
}

impl QueueProvider {
    /// Creates a provider, validating every queue's settings up front.
    ///
    /// # Parameters
    /// * `settings` - Queue settings by queue name
    ///
    /// # Returns
    /// * `Result<QueueProvider, QueueError>` - `Configuration` naming the
    ///   first invalid queue
    pub fn new(settings: HashMap<String, QueueSettings>) -> Result<QueueProvider, QueueError> {
        for (name, queue) in &settings {
            queue.validate().map_err(|err| {
                error!(error = err.to_string(), queue = name, "invalid queue settings");
                err
            })?;
        }

        Ok(QueueProvider {
            settings,
            queues: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Creates a provider from a JSON document of named queue settings.
    pub fn from_json(json: &str) -> Result<QueueProvider, QueueError> {
        let settings = serde_json::from_str(json).map_err(|err| {
            error!(error = err.to_string(), "failure to parse queue settings");
            QueueError::Configuration(err.to_string())
        })?;

        QueueProvider::new(settings)
    }

    /// Reads the JSON settings document at `path`.
    ///
    /// # Parameters
    /// * `path` - Settings file
    ///
    /// # Returns
    /// * `Result<QueueProvider, QueueError>` - `Configuration` when the file
    ///   cannot be read or parsed
    pub async fn from_file(path: impl AsRef<Path>) -> Result<QueueProvider, QueueError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|err| {
            error!(error = err.to_string(), path = %path.display(), "failure to read queue settings");
            QueueError::Configuration(format!("{}: {}", path.display(), err))
        })?;

        QueueProvider::from_json(&json)
    }

    /// Names of the configured queues, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.settings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the queue registered as `name`, creating it on first use.
    ///
    /// # Parameters
    /// * `name` - Queue name from the settings
    ///
    /// # Returns
    /// * `Result<Arc<dyn Queue>, QueueError>` - The shared queue instance,
    ///   `Configuration` for an unknown name or `Disposed` after `dispose`
    pub fn get(&self, name: &str) -> Result<Arc<dyn Queue>, QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed(name.to_owned()));
        }

        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let settings = self
            .settings
            .get(name)
            .ok_or_else(|| QueueError::Configuration(format!("unknown queue `{}`", name)))?;

        let queue = build(name, settings)?;
        debug!(queue = name, "queue created");
        queues.insert(name.to_owned(), queue.clone());

        Ok(queue)
    }

    /// Disposes every queue created so far; later lookups fail.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);

        let queues: Vec<_> = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        for (name, queue) in queues {
            queue.dispose().await;
            debug!(queue = name, "queue disposed");
        }
    }
}

fn build(name: &str, settings: &QueueSettings) -> Result<Arc<dyn Queue>, QueueError> {
    Ok(match settings.clone() {
        QueueSettings::RedisStream(settings) => Arc::new(RedisStreamQueue::new(name, settings)?),
        QueueSettings::Amqp(settings) => Arc::new(AmqpQueue::new(name, settings)?),
        QueueSettings::Mqtt(settings) => Arc::new(MqttQueue::new(name, settings)?),
    })
}
