// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQTT Queue
//!
//! [`Queue`] over an MQTT 3.1.1 broker. Every connection owns a `rumqttc`
//! event loop running on its own task; incoming publishes are dispatched to
//! each subscriber whose topic filter matches.
//!
//! MQTT 3.1.1 has no message headers, so tags and user properties are not
//! carried: subscriptions with a tag expression are rejected.

use super::filter::{matches, validate_filter, validate_topic_name};
use crate::{
    errors::QueueError,
    handler::MessageHandler,
    message::Message,
    options::{EnqueueOptions, Reliability, SubscribeOptions},
    queue::{Queue, QueueBase},
    registry::SubscriberRegistry,
    settings::{client_id, MqttSettings},
    subscriber::{Binding, Dispatch, Subscriber},
    supervisor::{Connector, DisconnectNotifier, ReconnectSupervisor},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Time a closing connection gets to flush its DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub fn qos(reliability: Reliability) -> QoS {
    match reliability {
        Reliability::AtMostOnce => QoS::AtMostOnce,
        Reliability::AtLeastOnce => QoS::AtLeastOnce,
        Reliability::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn classify(err: &ConnectionError) -> QueueError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            QueueError::BrokerError(format!("connection refused: {:?}", code))
        }
        _ => QueueError::ConnectionError(err.to_string()),
    }
}

/// Client half of a connection plus the controls of its event loop.
#[derive(Clone)]
pub struct MqttLink {
    pub client: AsyncClient,
    closing: Arc<AtomicBool>,
    stop: CancellationToken,
    stopped: CancellationToken,
}

pub struct MqttConnector {
    settings: MqttSettings,
    client: String,
    registry: Arc<SubscriberRegistry>,
    shutdown: CancellationToken,
}

impl MqttConnector {
    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client, &self.settings.server, self.settings.port);
        options
            .set_keep_alive(self.settings.keep_alive())
            .set_clean_session(self.settings.clean_session)
            .set_manual_acks(true);

        if let Some(user_name) = &self.settings.user_name {
            options.set_credentials(user_name, self.settings.password.clone().unwrap_or_default());
        }

        options
    }
}

fn to_message(client: &AsyncClient, publish: Publish) -> Message {
    let msg = Message::new(
        &Uuid::new_v4().to_string(),
        &publish.topic,
        None,
        publish.payload.to_vec(),
    );

    if publish.qos == QoS::AtMostOnce {
        return msg;
    }

    let client = client.clone();
    msg.with_ack(move || {
        let client = client.clone();
        let publish = publish.clone();
        async move {
            match client.ack(&publish).await {
                Ok(()) => true,
                Err(err) => {
                    error!(error = err.to_string(), topic = publish.topic, "error whiling ack msg");
                    false
                }
            }
        }
        .boxed()
    })
}

/// Dispatches `publish` to every matching subscriber on a task of its own so
/// the event loop keeps serving pings, then acknowledges it.
///
/// There is no negative acknowledgement in MQTT: a failed delivery is logged
/// and acknowledged so it does not keep one of the broker's in-flight slots.
fn deliver(registry: &SubscriberRegistry, client: &AsyncClient, publish: Publish) -> JoinHandle<()> {
    let subscribers = registry.matching(|filter| matches(filter, &publish.topic));
    let msg = to_message(client, publish);

    tokio::spawn(async move {
        debug!(topic = msg.topic(), id = msg.id(), subscribers = subscribers.len(), "received");

        for subscriber in subscribers {
            if subscriber.dispatch(msg.clone()).await == Dispatch::Failed {
                warn!(
                    topic = msg.topic(),
                    filter = subscriber.topic(),
                    id = msg.id(),
                    "message failed, acknowledging anyway"
                );
            }
        }

        msg.acknowledge(&CancellationToken::new()).await;
    })
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    link: MqttLink,
    registry: Arc<SubscriberRegistry>,
    notifier: DisconnectNotifier,
    connack: oneshot::Sender<Result<(), QueueError>>,
) {
    let _stopped = link.stopped.clone().drop_guard();
    let mut connack = Some(connack);

    loop {
        let event = tokio::select! {
            _ = link.stop.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(session_present = ack.session_present, epoch = notifier.epoch(), "connack received");
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                deliver(&registry, &link.client, publish);
            }
            Ok(_) => {}
            Err(err) => {
                match connack.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(classify(&err)));
                    }
                    None if !link.closing.load(Ordering::Acquire) => {
                        warn!(error = err.to_string(), epoch = notifier.epoch(), "mqtt connection lost");
                        notifier.notify();
                    }
                    None => debug!(epoch = notifier.epoch(), "mqtt event loop closed"),
                }
                break;
            }
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Connection = MqttLink;

    async fn connect(&self, notifier: DisconnectNotifier) -> Result<MqttLink, QueueError> {
        let (client, eventloop) = AsyncClient::new(self.options(), self.settings.capacity);
        let link = MqttLink {
            client,
            closing: Arc::new(AtomicBool::new(false)),
            stop: self.shutdown.child_token(),
            stopped: CancellationToken::new(),
        };

        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(run_event_loop(
            eventloop,
            link.clone(),
            self.registry.clone(),
            notifier,
            connack_tx,
        ));

        let connected = match timeout(self.settings.connect_timeout(), connack_rx).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(_)) => Err(QueueError::ConnectionError("mqtt event loop stopped".to_owned())),
            Err(_) => Err(QueueError::ConnectionError(format!(
                "no connack from {}:{}",
                self.settings.server, self.settings.port
            ))),
        };

        if let Err(err) = connected {
            error!(error = err.to_string(), server = self.settings.server, "failure to connect");
            link.stop.cancel();
            return Err(err);
        }

        debug!(client = self.client, server = self.settings.server, "mqtt connected");
        Ok(link)
    }

    async fn attach(
        &self,
        _supervisor: &Arc<ReconnectSupervisor<Self>>,
        link: &MqttLink,
        subscriber: &Arc<Subscriber>,
    ) -> Result<(), QueueError> {
        let filter = subscriber.topic();

        link.client
            .subscribe(filter, qos(subscriber.options().reliability))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), filter, "error to subscribe");
                QueueError::ConnectionError(err.to_string())
            })?;

        debug!(filter, "filter subscribed");
        subscriber.bind(Binding::EventDriven {
            handle: filter.to_owned(),
        });

        Ok(())
    }

    async fn detach(&self, link: Option<&MqttLink>, subscriber: &Subscriber) {
        let Binding::EventDriven { handle } = subscriber.take_binding() else {
            return;
        };
        let Some(link) = link else {
            return;
        };

        if self.registry.has_topic(&handle) {
            debug!(filter = handle, "filter still in use");
            return;
        }

        if let Err(err) = link.client.unsubscribe(&handle).await {
            warn!(error = err.to_string(), filter = handle, "failure to unsubscribe");
        }
    }

    async fn close(&self, link: MqttLink) {
        link.closing.store(true, Ordering::Release);

        if let Err(err) = link.client.disconnect().await {
            debug!(error = err.to_string(), "disconnect not sent");
        }
        if timeout(CLOSE_GRACE, link.stopped.cancelled()).await.is_err() {
            debug!("mqtt event loop did not stop in time");
        }
        link.stop.cancel();
    }
}

/// Lightweight pub/sub queue backed by an MQTT broker.
pub struct MqttQueue {
    base: QueueBase<MqttConnector>,
}

impl MqttQueue {
    pub fn new(name: &str, settings: MqttSettings) -> Result<MqttQueue, QueueError> {
        settings.validate()?;

        let retry = settings.reconnect;
        let registry = Arc::new(SubscriberRegistry::new());
        let connector = MqttConnector {
            client: client_id(&settings.client),
            settings,
            registry: registry.clone(),
            shutdown: CancellationToken::new(),
        };

        Ok(MqttQueue {
            base: QueueBase::with_registry(name, connector, retry, registry),
        })
    }

    pub fn base(&self) -> &QueueBase<MqttConnector> {
        &self.base
    }
}

#[async_trait]
impl Queue for MqttQueue {
    fn name(&self) -> &str {
        self.base.name()
    }

    /// Hands the message to the client; returns once it is queued for the
    /// broker. MQTT assigns no message id, so `None` is returned.
    async fn produce(
        &self,
        topic: &str,
        tags: Option<&str>,
        payload: &[u8],
        options: Option<&EnqueueOptions>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        validate_topic_name(topic)?;

        if tags.is_some_and(|t| !t.is_empty()) {
            debug!(topic, "tags are not carried over mqtt");
        }

        let reliability = options.map(|o| o.reliability).unwrap_or_default();
        let session = self.base.session(cancel).await?;

        let published = tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            published = session.connection.client.publish(topic, qos(reliability), false, payload.to_vec()) => {
                published.map_err(|err| {
                    error!(error = err.to_string(), topic, "error publishing message");
                    QueueError::ConnectionError(err.to_string())
                })
            }
        };

        match published {
            Ok(()) => Ok(None),
            Err(err) => {
                self.base.report(&session, &err);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        tags: Option<&str>,
        handler: Arc<dyn MessageHandler>,
        options: Option<SubscribeOptions>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Subscriber>, QueueError> {
        validate_filter(topic)?;

        if !matches!(tags, None | Some("") | Some("*")) {
            return Err(QueueError::InvalidArgument(
                "tag expressions are not supported over mqtt".to_owned(),
            ));
        }

        self.base.subscribe(topic, tags, handler, options, cancel).await
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) {
        self.base.unsubscribe(subscriber).await
    }

    async fn dispose(&self) {
        self.base.dispose().await
    }
}

impl Drop for MqttQueue {
    fn drop(&mut self) {
        self.base.supervisor().connector().shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::handler_fn, subscriber::SubscriptionKey};
    use std::sync::Mutex;

    fn connector(settings: MqttSettings) -> MqttConnector {
        MqttConnector {
            client: client_id(&settings.client),
            settings,
            registry: Arc::new(SubscriberRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn recording_subscriber(
        registry: &SubscriberRegistry,
        filter: &str,
        seen: Arc<Mutex<Vec<Message>>>,
    ) -> Arc<Subscriber> {
        let handler = handler_fn(move |msg: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(msg);
                Ok(())
            }
        });

        let subscriber = Arc::new(Subscriber::new(
            registry.next_seq(),
            SubscriptionKey::new(filter, None),
            Arc::new(handler),
            SubscribeOptions::default(),
            &CancellationToken::new(),
        ));
        registry.insert(subscriber.clone());
        subscriber
    }

    #[test]
    fn reliability_maps_to_qos() {
        assert_eq!(qos(Reliability::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(qos(Reliability::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(qos(Reliability::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn options_follow_settings() {
        let connector = connector(MqttSettings {
            client: Some("sensor-1".to_owned()),
            user_name: Some("user".to_owned()),
            password: Some("secret".to_owned()),
            clean_session: false,
            ..Default::default()
        });

        let options = connector.options();
        assert_eq!(options.client_id(), "sensor-1");
        assert_eq!(options.broker_address(), ("localhost".to_owned(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("user".to_owned(), "secret".to_owned()))
        );
    }

    #[tokio::test]
    async fn publishes_reach_matching_filters_only() {
        let registry = SubscriberRegistry::new();
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);

        let wildcard = Arc::new(Mutex::new(Vec::new()));
        let exact = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(Mutex::new(Vec::new()));
        recording_subscriber(&registry, "sensors/+/temp", wildcard.clone());
        recording_subscriber(&registry, "sensors/kitchen/temp", exact.clone());
        recording_subscriber(&registry, "alerts/#", other.clone());

        let publish = Publish::new("sensors/kitchen/temp", QoS::AtLeastOnce, "21.5");
        deliver(&registry, &client, publish).await.unwrap();

        let received = wildcard.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic(), "sensors/kitchen/temp");
        assert_eq!(received[0].payload(), b"21.5");
        assert_eq!(received[0].tags(), None);
        assert!(received[0].is_acknowledged());

        assert_eq!(exact.lock().unwrap().len(), 1);
        assert!(other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_deliveries_are_still_acknowledged() {
        let registry = SubscriberRegistry::new();
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let failing = Arc::new(Subscriber::new(
            registry.next_seq(),
            SubscriptionKey::new("jobs", None),
            Arc::new(handler_fn(|_msg: Message| async move {
                Err(crate::handler::HandlerError::from("boom"))
            })),
            SubscribeOptions::default(),
            &CancellationToken::new(),
        ));
        registry.insert(failing);
        recording_subscriber(&registry, "#", seen.clone());

        deliver(&registry, &client, Publish::new("jobs", QoS::AtLeastOnce, "run"))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_acknowledged());
    }

    #[tokio::test]
    async fn invalid_subscriptions_are_rejected_before_connecting() {
        let queue = MqttQueue::new("telemetry", MqttSettings::default()).unwrap();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(|_msg: Message| async move { Ok(()) }));
        let cancel = CancellationToken::new();

        let err = queue
            .subscribe("sensors/#/temp", None, handler.clone(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let err = queue
            .subscribe("sensors/+", Some("red"), handler, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));

        let err = queue
            .produce("sensors/+", None, b"1", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let err = MqttQueue::new(
            "telemetry",
            MqttSettings {
                capacity: 0,
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_produce() {
        let queue = MqttQueue::new(
            "telemetry",
            MqttSettings {
                server: "127.0.0.1".to_owned(),
                port: 1,
                connect_timeout_secs: 2,
                ..Default::default()
            },
        )
        .unwrap();

        let err = queue
            .produce("sensors/kitchen", None, b"1", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        queue.dispose().await;
    }
}
