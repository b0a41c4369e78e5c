// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Produce and Subscribe Options

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Default time a poll-driven subscriber waits on an empty receive.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery guarantee requested by a producer or a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Options applied to a single produced message.
///
/// Backends ignore the fields their broker cannot express.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub reliability: Reliability,
    pub properties: HashMap<String, serde_json::Value>,
}

impl EnqueueOptions {
    pub fn new() -> EnqueueOptions {
        EnqueueOptions::default()
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_owned(), value);
        self
    }
}

/// Options applied to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub reliability: Reliability,
    /// Upper bound a polling subscriber stays suspended on an empty receive.
    pub timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            reliability: Reliability::default(),
            timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl SubscribeOptions {
    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
