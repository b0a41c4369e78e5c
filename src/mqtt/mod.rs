// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQTT Backend
//!
//! Lightweight pub/sub backend over `rumqttc`, dispatching by topic filter.

pub mod filter;
pub mod queue;

pub use queue::MqttQueue;
