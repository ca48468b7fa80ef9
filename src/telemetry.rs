use std::time::{Duration, SystemTime};

use chrono::Utc;
use rumqttc::v5::{
    mqttbytes::{v5::Packet, QoS},
    AsyncClient, Event, EventLoop, MqttOptions,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    ConnectionState, DeviceCommand, DeviceState, TelemetryReading, FAN_TOPIC, LIGHT_TOPIC,
    TANK_LEVEL_TOPIC, ULTRASONIC_TOPIC,
};

/// processor options, these are static immutable settings
pub struct TelemetryOptions {
    /// URI of the mqtt broker, host:port
    pub broker_url: String,
    /// Client id, a time-derived one is generated when unset
    pub client_id: Option<String>,
    /// Optional broker credentials
    pub username: Option<String>,
    pub password: Option<String>,
    /// The structured topic carrying `{"temperatura": .., "humedad": ..}`
    pub data_topic: String,
    /// How long to wait after a dropped connection before polling again
    pub reconnect_period: Duration,
    /// Broker connect timeout in seconds
    pub connect_timeout_secs: u64,
}

/// Consumer side of the channel: observe decoded state, issue commands.
///
/// Cheap to clone; every clone observes the same connection.
#[derive(Clone)]
pub struct TelemetryHandle {
    cmd_tx: mpsc::Sender<DeviceCommand>,
    reconnect_tx: mpsc::Sender<()>,
    reading_rx: watch::Receiver<TelemetryReading>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl TelemetryHandle {
    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Last-known decoded reading plus raw last message
    pub fn reading(&self) -> TelemetryReading {
        self.reading_rx.borrow().clone()
    }

    /// Watch receiver for consumers that want change notifications
    pub fn watch_reading(&self) -> watch::Receiver<TelemetryReading> {
        self.reading_rx.clone()
    }

    /// Publishes a device command, at most once.
    ///
    /// Rejected (logged, not an error) while the connection is down; commands
    /// are never queued for later delivery.
    pub async fn publish(&self, topic: &str, state: DeviceState) {
        if self.state() != ConnectionState::Connected {
            warn!("Not connected, dropping {} command for {}", state.as_str(), topic);
            return;
        }
        if let Err(err) = self
            .cmd_tx
            .send(DeviceCommand {
                topic: topic.to_string(),
                state,
            })
            .await
        {
            warn!("Could not hand command to processor: {}", err);
        }
    }

    /// Nudges the processor to retry the broker immediately.
    ///
    /// No-op while connected; there is only ever one underlying connection.
    pub async fn reconnect(&self) {
        if self.state() == ConnectionState::Connected {
            return;
        }
        if let Err(err) = self.reconnect_tx.send(()).await {
            warn!("Could not request reconnect: {}", err);
        }
    }
}

/// The chief processor of incoming mqtt data, this handles
/// - mqtt connection state
/// - reception via mqtt and decoding of the structured telemetry topic
/// - publishing of device commands handed over by [`TelemetryHandle`]
///
/// Consuming `self` into [`TelemetryProcessor::process`] is what makes
/// connect idempotent: there is no processor left to open a second
/// connection with.
pub struct TelemetryProcessor {
    cancel_token: CancellationToken,
    cmd_rx: mpsc::Receiver<DeviceCommand>,
    reconnect_rx: mpsc::Receiver<()>,
    reading_tx: watch::Sender<TelemetryReading>,
    state_tx: watch::Sender<ConnectionState>,
    opts: TelemetryOptions,
}

impl TelemetryProcessor {
    /// Creates the processor, its consumer handle, and the broker options
    pub fn new(
        cancel_token: CancellationToken,
        opts: TelemetryOptions,
    ) -> (TelemetryProcessor, TelemetryHandle, MqttOptions) {
        let client_id = opts.client_id.clone().unwrap_or_else(|| {
            format!(
                "bodega-{:x}",
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .expect("Time went backwards")
                    .as_millis()
            )
        });
        let mut mqtt_opts = MqttOptions::new(
            client_id,
            opts.broker_url
                .split_once(':')
                .expect("Invalid broker URL")
                .0,
            opts.broker_url
                .split_once(':')
                .unwrap()
                .1
                .parse::<u16>()
                .expect("Invalid broker port"),
        );
        mqtt_opts
            .set_keep_alive(Duration::from_secs(20))
            .set_clean_start(true)
            .set_connection_timeout(opts.connect_timeout_secs);
        if let (Some(user), Some(pass)) = (&opts.username, &opts.password) {
            mqtt_opts.set_credentials(user.clone(), pass.clone());
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<DeviceCommand>(64);
        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>(4);
        let (reading_tx, reading_rx) = watch::channel(TelemetryReading::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        (
            TelemetryProcessor {
                cancel_token,
                cmd_rx,
                reconnect_rx,
                reading_tx,
                state_tx,
                opts,
            },
            TelemetryHandle {
                cmd_tx,
                reconnect_tx,
                reading_rx,
                state_rx,
            },
            mqtt_opts,
        )
    }

    /// This handles the single live connection, will not return until cancelled
    /// * `eventloop` - The eventloop to poll, created from the options returned by ::new
    /// * `client` - The async mqtt v5 client to use for subscriptions and publishes
    pub async fn process(mut self, client: AsyncClient, mut eventloop: EventLoop) {
        let mut reading = TelemetryReading::default();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Shutting down telemetry processor!");
                    // tear the transport down with the listeners, nothing may fire afterwards
                    if let Err(err) = client.disconnect().await {
                        trace!("Disconnect on shutdown failed: {}", err);
                    }
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    break;
                },
                msg = eventloop.poll() => match msg {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("Connected to broker");
                        self.state_tx.send_replace(ConnectionState::Connected);
                        self.subscribe_all(&client).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        let Ok(topic) = std::str::from_utf8(&msg.topic) else {
                            warn!("Could not parse topic, topic: {:?}", msg.topic);
                            continue;
                        };
                        let Ok(payload) = std::str::from_utf8(&msg.payload) else {
                            warn!("Non UTF-8 payload on {}, ignoring", topic);
                            continue;
                        };
                        trace!("Received [{}]: {}", topic, payload);
                        apply_message(&mut reading, &self.opts.data_topic, topic, payload);
                        self.reading_tx.send_replace(reading.clone());
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        warn!("Broker sent disconnect");
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        trace!("Received error: {}", e);
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        // the transport retries on the next poll, pace it
                        tokio::select! {
                            _ = self.cancel_token.cancelled() => {
                                self.state_tx.send_replace(ConnectionState::Disconnected);
                                break;
                            },
                            _ = tokio::time::sleep(self.opts.reconnect_period) => {},
                            _ = self.reconnect_rx.recv() => {
                                debug!("Manual reconnect requested");
                            },
                        }
                        self.state_tx.send_replace(ConnectionState::Connecting);
                    }
                },
                Some(cmd) = self.cmd_rx.recv() => {
                    let payload = serde_json::json!({ "estado": cmd.state.as_str() }).to_string();
                    trace!("Publishing to {}: {}", cmd.topic, payload);
                    let Ok(_) = client.publish(cmd.topic, QoS::AtMostOnce, false, payload.into_bytes()).await else {
                        warn!("Failed to publish device command!");
                        continue;
                    };
                }
            }
        }
    }

    /// Subscribes the fixed topic set, one failure does not block the rest
    async fn subscribe_all(&self, client: &AsyncClient) {
        let topics = [
            self.opts.data_topic.as_str(),
            TANK_LEVEL_TOPIC,
            ULTRASONIC_TOPIC,
            LIGHT_TOPIC,
            FAN_TOPIC,
        ];
        for topic in topics {
            match client.subscribe(topic, QoS::AtMostOnce).await {
                Ok(()) => debug!("Subscribed to {}", topic),
                Err(err) => warn!("Could not subscribe to {}: {}", topic, err),
            }
        }
    }
}

/// Folds one incoming message into the last-known reading.
///
/// The raw topic/payload pair is always recorded so consumers of raw sensor
/// topics can react without the processor needing per-topic logic. Only the
/// structured data topic is decoded, and each field is merged independently:
/// a bad `temperatura` does not block a good `humedad`, and a payload that is
/// not JSON leaves both prior values untouched.
fn apply_message(reading: &mut TelemetryReading, data_topic: &str, topic: &str, payload: &str) {
    reading.last_topic = topic.to_string();
    reading.last_payload = payload.to_string();
    reading.received_at = Some(Utc::now());

    if topic != data_topic {
        return;
    }
    let data: serde_json::Value = match serde_json::from_str(payload) {
        Ok(data) => data,
        Err(err) => {
            warn!("Unparsable telemetry payload: {}", err);
            return;
        }
    };
    if let Some(temp) = data.get("temperatura").and_then(|v| v.as_f64()) {
        reading.temperature = Some(temp);
    }
    if let Some(hum) = data.get("humedad").and_then(|v| v.as_f64()) {
        reading.humidity = Some(hum);
    }
}
