//! One-shot connectivity checks used by `kyz-ingestor --test-conn`.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, Packet, QoS};

use crate::{
    config::{AppConfig, MqttConfig, StoreConfig},
    error::{BrokerError, ConfigError, EXIT_FAILURE},
    sinks::{PgConnector, StoreConnector},
    sources::mqtt::mqtt_options,
};

pub const PROBE_CLIENT_ID: &str = "kyz-sql-ingestor-test";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect, subscribe to the ingest topic, and disconnect.
pub async fn check_broker(cfg: &MqttConfig, timeout: Duration) -> Result<(), BrokerError> {
    let mut options = mqtt_options(cfg, PROBE_CLIENT_ID);
    options.set_manual_acks(false);
    let (client, mut event_loop) = AsyncClient::new(options, 10);

    let handshake = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BrokerError::Refused(ack.code));
                    }
                    client.subscribe(cfg.topic.clone(), QoS::AtLeastOnce).await?;
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::Refused(code))
                }
                Err(e) => return Err(BrokerError::Connection(e)),
            }
        }
    };

    let result = match tokio::time::timeout(timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(timeout)),
    };

    if result.is_ok() && client.disconnect().await.is_ok() {
        // Let the DISCONNECT go out before the event loop is dropped.
        let _ = tokio::time::timeout(Duration::from_secs(1), event_loop.poll()).await;
    }
    result
}

pub async fn probe_broker(cfg: &MqttConfig, timeout: Duration) -> bool {
    match check_broker(cfg, timeout).await {
        Ok(()) => {
            tracing::info!(host = %cfg.host, port = cfg.port, topic = %cfg.topic, "broker check passed");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, host = %cfg.host, port = cfg.port, "broker check failed");
            false
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreCheckError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Open a connection, run the round-trip query, and close it.
pub async fn check_store(cfg: &StoreConfig) -> Result<(), StoreCheckError> {
    let connector = PgConnector::from_config(cfg)?;
    let mut conn = connector.connect().await?;
    let result = connector.ping(&mut conn).await;
    connector.close(conn).await;
    Ok(result?)
}

pub async fn probe_store(cfg: &StoreConfig) -> bool {
    match check_store(cfg).await {
        Ok(()) => {
            tracing::info!("store check passed");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "store check failed");
            false
        }
    }
}

/// Run both checks and return the process exit status: 0 only if both pass.
pub async fn run_connectivity_check(cfg: &AppConfig) -> i32 {
    let store_ok = probe_store(&cfg.store).await;
    let broker_ok = probe_broker(&cfg.mqtt, PROBE_TIMEOUT).await;

    if store_ok && broker_ok {
        0
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_broker() -> MqttConfig {
        toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 1
            "#,
        )
        .expect("mqtt section")
    }

    #[tokio::test]
    async fn unreachable_broker_fails_the_check() {
        assert!(!probe_broker(&unreachable_broker(), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn missing_store_uri_fails_the_check() {
        let cfg: StoreConfig = toml::from_str("").expect("store section");
        assert!(matches!(
            check_store(&cfg).await,
            Err(StoreCheckError::Config(ConfigError::Missing(_)))
        ));
    }
}
