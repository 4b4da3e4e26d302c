use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use switch_common::{BulbCommand, TOPIC_BULB_COMMAND, TOPIC_BULB_STATE};

/// Stand-in for the remote bulb server: answers every recognized command
/// with a retained state publish, the way the real gateway reports back
/// after driving the bulb over its radio link.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    // Set BULB_SIM_SILENT=1 to stop acknowledging commands; the controller
    // should fall back to bypass mode within its ack deadline.
    let silent = std::env::var("BULB_SIM_SILENT")
        .map(|value| value == "1")
        .unwrap_or(false);
    let ack_latency_ms = std::env::var("BULB_SIM_LATENCY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(150);

    let mut mqtt_options = MqttOptions::new("smart-switch-bulb-sim", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.subscribe(TOPIC_BULB_COMMAND, QoS::AtMostOnce)
        .await
        .context("failed to subscribe to bulb command topic")?;

    // Retained initial state so a restarting controller can resynchronize.
    mqtt.publish(
        TOPIC_BULB_STATE,
        QoS::AtLeastOnce,
        true,
        BulbCommand::Off.as_str(),
    )
    .await
    .context("failed to publish initial bulb state")?;

    info!("bulb simulator started (silent: {silent}, latency: {ack_latency_ms} ms)");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                let Ok(payload) = String::from_utf8(message.payload.to_vec()) else {
                    warn!("non utf8 command payload");
                    continue;
                };

                let command = if payload.contains("ON") {
                    Some(BulbCommand::On)
                } else if payload.contains("OFF") {
                    Some(BulbCommand::Off)
                } else {
                    None
                };

                let Some(command) = command else {
                    warn!("ignoring unrecognized command {payload}");
                    continue;
                };

                if silent {
                    info!("suppressing ack for {}", command.as_str());
                    continue;
                }

                tokio::time::sleep(Duration::from_millis(ack_latency_ms)).await;
                info!("bulb now {}", command.as_str());
                if let Err(err) = mqtt
                    .publish(TOPIC_BULB_STATE, QoS::AtLeastOnce, true, command.as_str())
                    .await
                {
                    warn!("bulb state publish failed: {err}");
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
            }
            Ok(_) => {}
            Err(err) => {
                warn!("bulb sim mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
