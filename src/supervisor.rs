// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Supervisor
//!
//! Owns the broker connection of one queue and serializes every attempt to
//! (re)establish it behind a single-slot gate:
//!
//! ```text
//! Disconnected ──ensure_connected──> Connecting ──ok──> Connected
//!      ▲                                  │                 │
//!      └──────────────failure─────────────┘   broker-initiated disconnect
//!      ▲                                                    │
//!      └────────────────────────────────────────────────────┘
//! ```
//!
//! Each established connection is numbered with an epoch. Backends receive a
//! [`DisconnectNotifier`] bound to that epoch and fire it when the broker drops
//! the connection; a background recovery task then reconnects under the same
//! gate and resubscribes every registered subscriber in registration order.
//! Notifications for an older epoch are ignored.

use crate::{
    errors::QueueError, registry::SubscriberRegistry, settings::ReconnectSettings,
    subscriber::Subscriber,
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Upper bound for releasing a connection that is being replaced or disposed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            CONNECTING => ConnectionState::Connecting,
            CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// A live connection and the epoch it was established in.
#[derive(Debug, Clone)]
pub struct Session<T> {
    pub epoch: u64,
    pub connection: T,
}

/// Handle a backend fires when the broker drops the connection of `epoch`.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    epoch: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl DisconnectNotifier {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn notify(&self) {
        let _ = self.tx.send(self.epoch);
    }
}

/// Broker-specific connection management driven by the supervisor.
#[async_trait]
pub trait Connector: Send + Sync + Sized + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Opens a new connection. `notifier` must be fired if the broker later
    /// drops it.
    async fn connect(&self, notifier: DisconnectNotifier) -> Result<Self::Connection, QueueError>;

    /// Binds `subscriber` to the broker on `connection`. Runs under the gate
    /// during recovery, so it must only use the connection it is given.
    async fn attach(
        &self,
        supervisor: &Arc<ReconnectSupervisor<Self>>,
        connection: &Self::Connection,
        subscriber: &Arc<Subscriber>,
    ) -> Result<(), QueueError>;

    /// Releases the broker resources of `subscriber`. Called once per subscriber.
    async fn detach(&self, connection: Option<&Self::Connection>, subscriber: &Subscriber);

    /// Closes a connection that is no longer used.
    async fn close(&self, connection: Self::Connection);
}

pub struct ReconnectSupervisor<C: Connector> {
    name: String,
    connector: C,
    registry: Arc<SubscriberRegistry>,
    retry: ReconnectSettings,
    state: AtomicU8,
    epoch: AtomicU64,
    attempts: AtomicU64,
    last_failure: Mutex<Option<QueueError>>,
    session: RwLock<Option<Session<C::Connection>>>,
    gate: tokio::sync::Mutex<()>,
    recovering: AtomicBool,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    disconnects: mpsc::UnboundedSender<u64>,
    recovery: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(name: &str, connector: C, retry: ReconnectSettings) -> Arc<Self> {
        Self::with_registry(name, connector, retry, Arc::new(SubscriberRegistry::new()))
    }

    /// Creates a supervisor over a registry the connector also holds.
    pub fn with_registry(
        name: &str,
        connector: C,
        retry: ReconnectSettings,
        registry: Arc<SubscriberRegistry>,
    ) -> Arc<Self> {
        let (disconnects, recovery) = mpsc::unbounded_channel();

        Arc::new(ReconnectSupervisor {
            name: name.to_owned(),
            connector,
            registry,
            retry,
            state: AtomicU8::new(DISCONNECTED),
            epoch: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            session: RwLock::new(None),
            gate: tokio::sync::Mutex::new(()),
            recovering: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            disconnects,
            recovery: Mutex::new(Some(recovery)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Epoch of the most recently established connection, `0` before the first one.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Parent token of every subscriber; cancelled on dispose.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The live session, if connected.
    pub fn current(&self) -> Option<Session<C::Connection>> {
        if self.state.load(Ordering::Acquire) != CONNECTED {
            return None;
        }
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_disposed(&self) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed(self.name.clone()));
        }
        Ok(())
    }

    fn last_failure(&self) -> Option<QueueError> {
        self.last_failure.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_outcome(&self, failure: Option<QueueError>) {
        *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    async fn acquire_gate(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, QueueError> {
        tokio::select! {
            guard = self.gate.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            _ = self.shutdown.cancelled() => Err(QueueError::Disposed(self.name.clone())),
        }
    }

    /// Returns the live session, connecting first when needed.
    ///
    /// Callers that queued on the gate while another caller's attempt failed
    /// receive that same failure instead of starting a new attempt.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Session<C::Connection>, QueueError> {
        self.check_disposed()?;

        if let Some(session) = self.current() {
            return Ok(session);
        }

        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let _gate = self.acquire_gate(cancel).await?;

        self.check_disposed()?;

        if let Some(session) = self.current() {
            return Ok(session);
        }

        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(err) = self.last_failure() {
                return Err(err);
            }
        }

        self.connect_locked(cancel).await
    }

    /// Reports that the connection of `epoch` was lost.
    pub fn connection_lost(&self, epoch: u64) {
        let _ = self.disconnects.send(epoch);
    }

    /// Replaces the connection of `epoch` and resubscribes everything.
    /// A notification for an epoch that was already replaced is a no-op.
    pub async fn recover(self: &Arc<Self>, epoch: u64, cancel: &CancellationToken) -> Result<(), QueueError> {
        let _gate = self.acquire_gate(cancel).await?;

        self.check_disposed()?;

        if self.epoch() != epoch {
            debug!(queue = self.name, epoch, "ignoring stale disconnect");
            return Ok(());
        }

        self.recovering.store(true, Ordering::Release);

        if self.state.load(Ordering::Acquire) == CONNECTED {
            let lost = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
            self.state.store(DISCONNECTED, Ordering::Release);

            if let Some(lost) = lost {
                self.close(lost.connection).await;
            }
        }

        self.connect_locked(cancel).await.map(|_| ())
    }

    async fn connect_locked(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Session<C::Connection>, QueueError> {
        self.state.store(CONNECTING, Ordering::Release);

        let epoch = self.epoch() + 1;
        let notifier = DisconnectNotifier {
            epoch,
            tx: self.disconnects.clone(),
        };

        debug!(queue = self.name, epoch, "connecting...");

        let result = tokio::select! {
            result = self.connector.connect(notifier) => result,
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            _ = self.shutdown.cancelled() => Err(QueueError::Disposed(self.name.clone())),
        };

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                self.state.store(DISCONNECTED, Ordering::Release);
                if err != QueueError::Cancelled {
                    error!(error = err.to_string(), queue = self.name, "failure to connect");
                    self.record_outcome(Some(err.clone()));
                }
                return Err(err);
            }
        };

        if self.is_disposed() {
            self.close(connection).await;
            self.state.store(DISCONNECTED, Ordering::Release);
            return Err(QueueError::Disposed(self.name.clone()));
        }

        let session = Session { epoch, connection };
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.epoch.store(epoch, Ordering::Release);
        self.record_outcome(None);
        self.state.store(CONNECTED, Ordering::Release);

        debug!(queue = self.name, epoch, "connected");

        self.start_recovery();

        if self.recovering.swap(false, Ordering::AcqRel) {
            self.resubscribe_all(&session).await;
        }

        Ok(session)
    }

    /// Attaches every registered subscriber to `session`, in registration
    /// order. A failure is logged and does not stop the remaining ones.
    /// Returns how many subscribers were restored.
    pub(crate) async fn resubscribe_all(self: &Arc<Self>, session: &Session<C::Connection>) -> usize {
        let subscribers = self.registry.snapshot();
        let total = subscribers.len();
        let mut restored = 0;

        for subscriber in subscribers {
            if subscriber.is_unsubscribed() {
                continue;
            }

            match self
                .connector
                .attach(self, &session.connection, &subscriber)
                .await
            {
                Ok(()) => {
                    restored += 1;
                    debug!(queue = self.name, topic = subscriber.topic(), "subscriber restored");
                }
                Err(err) => error!(
                    error = err.to_string(),
                    queue = self.name,
                    topic = subscriber.topic(),
                    "failure to restore subscriber"
                ),
            }
        }

        debug!(queue = self.name, restored, total, "resubscription finished");
        restored
    }

    fn start_recovery(self: &Arc<Self>) {
        let rx = self.recovery.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rx) = rx {
            tokio::spawn(run_recovery(Arc::downgrade(self), rx, self.shutdown.clone()));
        }
    }

    async fn close(&self, connection: C::Connection) {
        if tokio::time::timeout(CLOSE_TIMEOUT, self.connector.close(connection))
            .await
            .is_err()
        {
            warn!(queue = self.name, "timeout closing connection");
        }
    }

    /// Stops background tasks without waiting for broker round trips.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Releases every subscriber and the connection. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();

        let session = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
        self.state.store(DISCONNECTED, Ordering::Release);

        for subscriber in self.registry.drain() {
            if subscriber.mark_unsubscribed() {
                self.connector
                    .detach(session.as_ref().map(|s| &s.connection), &subscriber)
                    .await;
            }
        }

        if let Some(session) = session {
            self.close(session.connection).await;
        }

        debug!(queue = self.name, "disposed");
    }
}

async fn run_recovery<C: Connector>(
    supervisor: Weak<ReconnectSupervisor<C>>,
    mut rx: mpsc::UnboundedReceiver<u64>,
    shutdown: CancellationToken,
) {
    loop {
        let epoch = tokio::select! {
            _ = shutdown.cancelled() => break,
            epoch = rx.recv() => match epoch {
                Some(epoch) => epoch,
                None => break,
            },
        };

        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };

        if supervisor.epoch() != epoch {
            continue;
        }

        warn!(queue = supervisor.name, epoch, "broker connection lost, reconnecting");

        let attempts = supervisor.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match supervisor.recover(epoch, &shutdown).await {
                Ok(()) => break,
                Err(QueueError::Disposed(_)) | Err(QueueError::Cancelled) => return,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = supervisor.name,
                        attempt,
                        "failure to reconnect"
                    );

                    if attempt == attempts {
                        error!(
                            queue = supervisor.name,
                            "reconnect attempts exhausted, next operation will retry"
                        );
                        break;
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(supervisor.retry.delay()) => {}
                    }
                }
            }
        }
    }
}
