use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use switch_common::{
    BridgeEngine, BulbCommand, EngineAction, RuntimeConfig, AVAILABILITY_DOWN, AVAILABILITY_UP,
    TOPIC_BULB_COMMAND, TOPIC_BULB_STATE, TOPIC_BULB_UPDATE, TOPIC_SWITCH_LWT,
    TOPIC_SWITCH_STATS, TOPIC_SWITCH_STATUS,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<BridgeEngine>>,
    outputs: Arc<Mutex<Outputs>>,
    mqtt: AsyncClient,
}

/// Host stand-ins for the physical outputs. Both perform the write only on a
/// state change; GPIO drivers on the Shelly build hook in here.
struct Outputs {
    relay: Relay,
    shadow: ShadowLed,
}

struct Relay {
    on: bool,
}

impl Relay {
    fn set(&mut self, on: bool) {
        if self.on != on {
            self.on = on;
            info!("relay {}", if on { "ON" } else { "OFF" });
        }
    }
}

struct ShadowLed {
    on: bool,
}

impl ShadowLed {
    fn set(&mut self, on: bool) {
        if self.on != on {
            self.on = on;
            info!("shadow led {}", if on { "ON" } else { "OFF" });
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("smart-switch-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_SWITCH_LWT,
        AVAILABILITY_DOWN,
        QoS::AtLeastOnce,
        true,
    ));

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let engine = BridgeEngine::new(runtime.bridge.clone());
    let bridge_config = engine.config.clone();

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        outputs: Arc::new(Mutex::new(Outputs {
            relay: Relay { on: false },
            shadow: ShadowLed { on: false },
        })),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), bridge_config.tick_interval_ms);
    spawn_status_publish_loop(app_state.clone(), bridge_config.status_publish_interval_ms);
    spawn_stats_loop(app_state.clone(), bridge_config.stats_interval_ms);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/toggle", post(handle_toggle))
        .with_state(app_state);

    let port = std::env::var("SWITCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind switch API at {addr}"))?;

    info!("switch controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_runtime_config() -> RuntimeConfig {
    let Some(path) = std::env::var_os("SWITCH_CONFIG").map(PathBuf::from) else {
        let mut runtime = RuntimeConfig::default();
        runtime.bridge.sanitize();
        return runtime;
    };

    RuntimeConfig::load(&path).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        let mut runtime = RuntimeConfig::default();
        runtime.bridge.sanitize();
        runtime
    })
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_BULB_STATE, TOPIC_BULB_UPDATE] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        let mut connected = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                        .await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected = true;
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_SWITCH_LWT, QoS::AtLeastOnce, true, AVAILABILITY_UP)
                        .await
                    {
                        warn!("availability publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    // One counter hit per connected->disconnected transition.
                    if connected {
                        connected = false;
                        let mut engine = app_state.engine.lock().await;
                        match err {
                            rumqttc::ConnectionError::Io(_) => engine.record_network_loss(),
                            _ => engine.record_channel_loss(),
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, tick_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));

        loop {
            interval.tick().await;
            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(monotonic_ms())
            };
            execute_engine_actions(&app_state, actions).await;
        }
    });
}

fn spawn_status_publish_loop(app_state: AppState, publish_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(publish_interval_ms));
        loop {
            interval.tick().await;

            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&engine.status(monotonic_ms()))
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_SWITCH_STATUS, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("switch status publish failed: {err}");
                    }
                }
                Err(err) => warn!("switch status serialization failed: {err}"),
            }
        }
    });
}

fn spawn_stats_loop(app_state: AppState, stats_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(stats_interval_ms));
        loop {
            interval.tick().await;

            let stats = {
                let engine = app_state.engine.lock().await;
                engine.stats(monotonic_ms())
            };
            let counters = stats.counters;
            info!(
                "stats: networkLost {}, channelLost {}, resyncs {}, missedAcks {}, toggles {}",
                counters.network_lost,
                counters.channel_lost,
                counters.resyncs,
                counters.missed_acks,
                counters.toggles
            );

            match serde_json::to_vec(&stats) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_SWITCH_STATS, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("stats publish failed: {err}");
                    }
                }
                Err(err) => warn!("stats serialization failed: {err}"),
            }
        }
    });
}

/// Runs one engine action batch in order. The outputs lock is held across
/// the whole batch so a discharge sequence never interleaves with another
/// batch's relay writes.
async fn execute_engine_actions(app_state: &AppState, actions: Vec<EngineAction>) {
    if actions.is_empty() {
        return;
    }

    let mut outputs = app_state.outputs.lock().await;
    for action in actions {
        match action {
            EngineAction::RelayOn => outputs.relay.set(true),
            EngineAction::RelayOff => outputs.relay.set(false),
            EngineAction::ShadowOn => outputs.shadow.set(true),
            EngineAction::ShadowOff => outputs.shadow.set(false),
            EngineAction::Delay(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            EngineAction::Publish(command) => publish_command(app_state, command).await,
        }
    }
}

async fn publish_command(app_state: &AppState, command: BulbCommand) {
    info!("sending {} to {}", command.as_str(), TOPIC_BULB_COMMAND);
    if let Err(err) = app_state
        .mqtt
        .publish(
            TOPIC_BULB_COMMAND,
            QoS::AtLeastOnce,
            false,
            command.as_str(),
        )
        .await
    {
        // The ack deadline is already armed; a failed publish surfaces as a
        // missed ack and the bypass path takes over.
        warn!("bulb command publish failed: {err}");
    }
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: Vec<u8>) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }

    match topic {
        TOPIC_BULB_STATE | TOPIC_BULB_UPDATE => {
            let Ok(message) = String::from_utf8(payload) else {
                warn!("non utf8 payload on topic {topic}");
                return;
            };
            info!("got {message} on topic {topic}");

            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.handle_notification(&message, monotonic_ms())
            };
            execute_engine_actions(app_state, actions).await;
        }
        _ => {}
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = {
        let engine = state.engine.lock().await;
        engine.status(monotonic_ms())
    };
    Json(status)
}

/// Host stand-in for the debounced button edge source.
async fn handle_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let actions = {
        let mut engine = state.engine.lock().await;
        engine.handle_toggle(monotonic_ms())
    };
    execute_engine_actions(&state, actions).await;
    handle_get_status(State(state)).await.into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
