use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, Publish, QoS,
};
use tokio::sync::watch;

use crate::{
    config::MqttConfig,
    pipeline::{Envelope, IngestPipeline},
    sinks::StoreConnector,
};

/// Request channel capacity between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 32;
/// How long to keep polling after DISCONNECT so it reaches the broker.
const DISCONNECT_DRAIN: Duration = Duration::from_secs(2);

pub fn mqtt_options(cfg: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    options.set_keep_alive(cfg.keepalive());
    options.set_clean_session(true);
    options.set_manual_acks(true);
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password().unwrap_or_default());
    }
    options
}

/// Doubling delay between broker reconnect attempts.
#[derive(Debug, Clone)]
pub struct BrokerBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl BrokerBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn from_config(cfg: &MqttConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.reconnect_min_secs),
            Duration::from_secs(cfg.reconnect_max_secs),
        )
    }

    /// The delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

/// The requests the session sends back to the broker.
pub trait SessionClient: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), ClientError>;

    fn ack(&self, publish: &Publish) -> Result<(), ClientError>;
}

impl SessionClient for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
    }

    fn ack(&self, publish: &Publish) -> Result<(), ClientError> {
        self.try_ack(publish)
    }
}

/// Reacts to one event-loop result at a time: subscribes on ConnAck, runs
/// publishes through the pipeline, and paces reconnects.
pub struct EventHandler<C: StoreConnector, K: SessionClient> {
    topic: String,
    client: K,
    backoff: BrokerBackoff,
    pipeline: IngestPipeline<C>,
}

impl<C: StoreConnector, K: SessionClient> EventHandler<C, K> {
    pub fn new(topic: String, client: K, backoff: BrokerBackoff, pipeline: IngestPipeline<C>) -> Self {
        Self {
            topic,
            client,
            backoff,
            pipeline,
        }
    }

    /// Returns how long to wait before polling again, if the connection failed.
    pub async fn on_event(&mut self, event: Result<Event, ConnectionError>) -> Option<Duration> {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    tracing::info!(topic = %self.topic, "connected to broker; subscribing");
                    self.backoff.reset();
                    // Clean sessions drop subscriptions, so subscribe on every ConnAck.
                    if let Err(e) = self.client.subscribe(&self.topic) {
                        tracing::error!(error = %e, topic = %self.topic, "failed to queue subscribe");
                    }
                } else {
                    tracing::error!(code = ?ack.code, "broker refused connection");
                }
                None
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::info!(topic = %self.topic, "subscription acknowledged");
                None
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.dispatch(publish).await;
                None
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("broker sent disconnect");
                None
            }
            Ok(_) => None,
            Err(e) => {
                let delay = self.backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "broker connection error; reconnecting"
                );
                metrics::counter!("kyz_broker_connect_failures_total").increment(1);
                Some(delay)
            }
        }
    }

    async fn dispatch(&mut self, publish: Publish) {
        if publish.topic != self.topic {
            tracing::debug!(topic = %publish.topic, "ignoring message on unexpected topic");
        } else {
            let msg = Envelope::now(publish.payload.to_vec());
            self.pipeline.handle(&msg).await;
        }

        // Acked after processing so a crash mid-message means redelivery.
        if let Err(e) = self.client.ack(&publish) {
            tracing::warn!(error = %e, "failed to queue publish ack");
        }
    }

    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}

/// The long-running broker session: one client, one subscription, and the
/// pipeline that every inbound message on that subscription goes through.
pub struct IngestSession<C: StoreConnector> {
    client: AsyncClient,
    event_loop: EventLoop,
    handler: EventHandler<C, AsyncClient>,
}

impl<C: StoreConnector> IngestSession<C> {
    pub fn new(cfg: &MqttConfig, pipeline: IngestPipeline<C>) -> Self {
        let (client, event_loop) =
            AsyncClient::new(mqtt_options(cfg, &cfg.client_id), REQUEST_CAPACITY);
        let handler = EventHandler::new(
            cfg.topic.clone(),
            client.clone(),
            BrokerBackoff::from_config(cfg),
            pipeline,
        );
        Self {
            client,
            event_loop,
            handler,
        }
    }

    /// Drive the session until `shutdown` flips to true (or its sender is
    /// dropped). A message being processed is always finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(topic = %self.handler.topic, "starting broker session");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = self.event_loop.poll() => event,
            };

            if let Some(delay) = self.handler.on_event(event).await {
                if !interruptible_sleep(&mut shutdown, delay).await {
                    break;
                }
            }
        }

        self.stop().await;
    }

    async fn stop(mut self) {
        tracing::info!("stopping broker session");
        if self.client.try_disconnect().is_ok() {
            let drain = async {
                // Flushes pending acks and the DISCONNECT; ends once the socket closes.
                while self.event_loop.poll().await.is_ok() {}
            };
            let _ = tokio::time::timeout(DISCONNECT_DRAIN, drain).await;
        }
        self.handler.shutdown().await;
        tracing::info!("broker session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{IntervalConfig, DEFAULT_TOPIC},
        sinks::{testing::ScriptedStore, IntervalWriter, WriterSettings},
        transform::LocalZone,
    };
    use rumqttc::ConnAck;
    use std::sync::{Arc, Mutex};

    /// Records requests, noting how many rows were stored when each ack went out.
    #[derive(Clone)]
    struct RecordingClient {
        store: ScriptedStore,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingClient {
        fn log(&self) -> Vec<String> {
            self.log.lock().expect("log").clone()
        }
    }

    impl SessionClient for RecordingClient {
        fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
            self.log.lock().expect("log").push(format!("subscribe {topic}"));
            Ok(())
        }

        fn ack(&self, publish: &Publish) -> Result<(), ClientError> {
            let stored = self.store.stored().len();
            self.log
                .lock()
                .expect("log")
                .push(format!("ack {} stored={stored}", publish.topic));
            Ok(())
        }
    }

    fn writer_settings() -> WriterSettings {
        WriterSettings {
            connect_backoff_base: Duration::from_millis(1),
            connect_backoff_max: Duration::from_millis(2),
            write_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    async fn test_pipeline(store: &ScriptedStore) -> IngestPipeline<ScriptedStore> {
        let writer = IntervalWriter::connect(store.clone(), writer_settings()).await;
        let interval = IntervalConfig {
            pulses_per_kwh: Some(1000.0),
            ..IntervalConfig::default()
        };
        IngestPipeline::new(interval, LocalZone::Named(chrono_tz::Tz::UTC), writer)
    }

    async fn handler(store: &ScriptedStore) -> (EventHandler<ScriptedStore, RecordingClient>, RecordingClient) {
        let client = RecordingClient {
            store: store.clone(),
            log: Arc::default(),
        };
        let backoff = BrokerBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let handler = EventHandler::new(
            DEFAULT_TOPIC.to_string(),
            client.clone(),
            backoff,
            test_pipeline(store).await,
        );
        (handler, client)
    }

    fn publish(topic: &str, body: &str) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtLeastOnce,
            body.as_bytes().to_vec(),
        ))))
    }

    fn connection_lost() -> Result<Event, ConnectionError> {
        Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    #[tokio::test]
    async fn connack_subscribes_and_resets_reconnect_delay() {
        let store = ScriptedStore::default();
        let (mut handler, client) = handler(&store).await;

        assert_eq!(handler.on_event(connection_lost()).await, Some(Duration::from_secs(1)));
        assert_eq!(handler.on_event(connection_lost()).await, Some(Duration::from_secs(2)));

        let connack = Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        assert_eq!(handler.on_event(connack).await, None);
        assert_eq!(client.log(), vec![format!("subscribe {DEFAULT_TOPIC}")]);

        assert_eq!(handler.on_event(connection_lost()).await, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn refused_connack_does_not_subscribe() {
        let store = ScriptedStore::default();
        let (mut handler, client) = handler(&store).await;

        let refused = Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        ))));
        handler.on_event(refused).await;

        assert!(client.log().is_empty());
    }

    #[tokio::test]
    async fn message_is_acked_only_after_it_is_stored() {
        let store = ScriptedStore::default();
        let (mut handler, client) = handler(&store).await;

        handler.on_event(publish(DEFAULT_TOPIC, "d=10,t=500")).await;

        assert_eq!(store.stored().len(), 1);
        assert_eq!(client.log(), vec![format!("ack {DEFAULT_TOPIC} stored=1")]);
    }

    #[tokio::test]
    async fn other_topic_is_ignored_but_acked() {
        let store = ScriptedStore::default();
        let (mut handler, client) = handler(&store).await;

        handler.on_event(publish("pri/energy/other", "d=10")).await;

        assert!(store.stored().is_empty());
        assert_eq!(client.log(), vec!["ack pri/energy/other stored=0".to_string()]);
    }

    #[tokio::test]
    async fn malformed_message_is_still_acked() {
        let store = ScriptedStore::default();
        let (mut handler, client) = handler(&store).await;

        handler.on_event(publish(DEFAULT_TOPIC, "garbage")).await;
        handler.on_event(publish(DEFAULT_TOPIC, "d=4")).await;

        assert_eq!(store.stored().len(), 1);
        assert_eq!(
            client.log(),
            vec![
                format!("ack {DEFAULT_TOPIC} stored=0"),
                format!("ack {DEFAULT_TOPIC} stored=1"),
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_during_reconnect_delay_closes_store() {
        let store = ScriptedStore::default();
        let cfg: MqttConfig = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 1
            reconnect_min_secs = 30
            reconnect_max_secs = 60
            "#,
        )
        .expect("mqtt section");
        let session = IngestSession::new(&cfg, test_pipeline(&store).await);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(stop_rx));

        // Nothing listens on port 1, so the session is in its 30s reconnect delay.
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("session stops well before the reconnect delay ends")
            .expect("session task");
        assert_eq!(store.close_calls(), 1);
    }

    fn mqtt_config() -> MqttConfig {
        toml::from_str(
            r#"
            host = "broker.local"
            username = "kyz"
            password_env = "KYZ_TEST_UNSET_PASSWORD_VAR"
            "#,
        )
        .expect("mqtt section")
    }

    #[test]
    fn backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = BrokerBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn options_carry_session_settings() {
        let cfg = mqtt_config();
        let options = mqtt_options(&cfg, "kyz-sql-ingestor");

        assert_eq!(options.client_id(), "kyz-sql-ingestor");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.clean_session());
        assert!(options.manual_acks());
        assert!(options.credentials().is_some());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, Duration::from_millis(1)).await);
    }
}
