//! Subscribe to a topic and print every payload until Ctrl+C.

use std::{process, time::Duration};

use clap::Parser;
use kyz_ingestor::{config::DEFAULT_TOPIC, error::EXIT_CONFIG_ERROR, observability};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Parser)]
#[command(name = "mqtt_probe")]
#[command(about = "Print payloads published on an MQTT topic")]
struct Args {
    #[arg(default_value = DEFAULT_TOPIC)]
    topic: String,

    #[arg(long, env = "MQTT_HOST")]
    host: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, default_value = "kyz-mqtt-probe")]
    client_id: String,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// 0, 1 or 2
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn options(args: &Args, host: &str) -> MqttOptions {
    let mut options = MqttOptions::new(args.client_id.clone(), host, args.port);
    options.set_keep_alive(Duration::from_secs(60));
    if let Some(username) = args.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(username, args.password.clone().unwrap_or_default());
    }
    options
}

#[tokio::main]
async fn main() {
    let _log_guard = observability::init_tracing(None);
    let args = Args::parse();

    let Some(host) = args.host.clone().filter(|h| !h.trim().is_empty()) else {
        tracing::error!("no broker host: pass --host or set MQTT_HOST");
        process::exit(EXIT_CONFIG_ERROR);
    };

    let (client, mut event_loop) = AsyncClient::new(options(&args, &host), 10);
    let qos = qos(args.qos);

    tracing::info!(%host, port = args.port, topic = %args.topic, "listening; Ctrl+C to stop");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Err(e) = client.try_subscribe(args.topic.clone(), qos) {
                    tracing::error!(error = %e, "failed to subscribe");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let ts = OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| "-".to_string());
                println!(
                    "{ts} {} {}",
                    publish.topic,
                    String::from_utf8_lossy(&publish.payload)
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "connection error; retrying in 2s");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    let _ = client.try_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_passed_to_the_broker() {
        let args = Args::try_parse_from([
            "mqtt_probe",
            "--username",
            "kyz",
            "--password",
            "secret",
        ])
        .expect("args");

        let options = options(&args, "broker.local");

        assert!(options.credentials().is_some());
        assert_eq!(options.broker_address(), ("broker.local".to_string(), args.port));
    }

    #[test]
    fn topic_defaults_to_interval_topic() {
        let args = Args::try_parse_from(["mqtt_probe"]).expect("args");
        assert_eq!(args.topic, DEFAULT_TOPIC);
        assert_eq!(args.qos, 1);
    }
}
