// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable Queue
//!
//! One produce/subscribe contract over three brokers: Redis Streams
//! ([`redis_stream`]), RabbitMQ ([`amqp`]) and MQTT ([`mqtt`]). Connections
//! are established lazily, recovered in the background after transient
//! faults, and every subscription is restored on the new connection.
//!
//! ```ignore
//! let provider = QueueProvider::from_file("queues.json").await?;
//! let orders = provider.get("orders")?;
//!
//! orders
//!     .subscribe("created", None, Arc::new(handler_fn(|msg: Message| async move {
//!         println!("{:?}", msg.payload());
//!         Ok(())
//!     })), None, &CancellationToken::new())
//!     .await?;
//!
//! orders.produce("created", None, b"{}", None, &CancellationToken::new()).await?;
//! ```

pub mod amqp;
pub mod errors;
pub mod handler;
pub mod message;
pub mod mqtt;
pub mod options;
pub mod provider;
pub mod queue;
pub mod redis_stream;
pub mod registry;
pub mod settings;
pub mod subscriber;
pub mod supervisor;

pub use errors::QueueError;
pub use handler::{handler_fn, HandlerError, HandlerResult, MessageHandler};
pub use message::Message;
pub use options::{EnqueueOptions, Reliability, SubscribeOptions};
pub use provider::QueueProvider;
pub use queue::Queue;
pub use settings::QueueSettings;
pub use subscriber::Subscriber;
