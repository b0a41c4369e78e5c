// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Registry
//!
//! Concurrent map of the subscriptions registered on one queue, keyed by
//! `(topic, tags)`. Registration order is kept so recovery can resubscribe
//! in the order subscriptions were made.

use crate::subscriber::{Subscriber, SubscriptionKey};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_seq: AtomicU64,
    entries: RwLock<HashMap<SubscriptionKey, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> SubscriberRegistry {
        SubscriberRegistry::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionKey, Arc<Subscriber>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionKey, Arc<Subscriber>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequence number for the next subscriber created on this queue.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `subscriber`, returning the subscriber it replaced, if any.
    pub fn insert(&self, subscriber: Arc<Subscriber>) -> Option<Arc<Subscriber>> {
        self.write().insert(subscriber.key().clone(), subscriber)
    }

    /// Removes `subscriber` if it is still the registered one for its key.
    pub fn remove(&self, subscriber: &Subscriber) -> bool {
        let mut entries = self.write();
        match entries.get(subscriber.key()) {
            Some(current) if current.id() == subscriber.id() => {
                entries.remove(subscriber.key());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<Arc<Subscriber>> {
        self.read().get(key).cloned()
    }

    /// All subscribers in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        let mut subscribers: Vec<_> = self.read().values().cloned().collect();
        subscribers.sort_by_key(|s| s.seq());
        subscribers
    }

    /// Subscribers whose topic satisfies `predicate`, in registration order.
    pub fn matching<P>(&self, predicate: P) -> Vec<Arc<Subscriber>>
    where
        P: Fn(&str) -> bool,
    {
        let mut subscribers: Vec<_> = self
            .read()
            .values()
            .filter(|s| predicate(s.topic()))
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.seq());
        subscribers
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.read().keys().any(|k| k.topic == topic)
    }

    /// Removes and returns every subscriber, in registration order.
    pub fn drain(&self) -> Vec<Arc<Subscriber>> {
        let mut subscribers: Vec<_> = self.write().drain().map(|(_, s)| s).collect();
        subscribers.sort_by_key(|s| s.seq());
        subscribers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
