use std::time::Duration;

use bodega_monitor::{
    fill_percent,
    telemetry::{TelemetryHandle, TelemetryOptions, TelemetryProcessor},
    ULTRASONIC_TOPIC,
};
use clap::Parser;
use rumqttc::v5::AsyncClient;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// bodega-monitor command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct MonitorArgs {
    /// The MQTT broker URL, host:port
    #[arg(
        short = 'u',
        long,
        default_value = "localhost:1883",
        env = "BODEGA_MONITOR_MQTT_URL"
    )]
    mqtt_url: String,

    /// The structured telemetry topic carrying temperature and humidity
    #[arg(
        short = 't',
        long,
        default_value = "iot/ambiente",
        env = "BODEGA_MONITOR_DATA_TOPIC"
    )]
    data_topic: String,

    /// Broker username
    #[arg(long, env = "BODEGA_MONITOR_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// Broker password
    #[arg(long, env = "BODEGA_MONITOR_MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Fixed client id, a time-derived one is generated when unset
    #[arg(long, env = "BODEGA_MONITOR_CLIENT_ID")]
    client_id: Option<String>,

    /// Tank height in centimeters, for the fill-level computation
    #[arg(long, default_value_t = 100.0, env = "BODEGA_MONITOR_TANK_HEIGHT_CM")]
    tank_height_cm: f64,

    /// Seconds to wait before re-polling a dropped connection
    #[arg(long, default_value_t = 5, env = "BODEGA_MONITOR_RECONNECT_SECS")]
    reconnect_secs: u64,

    /// Broker connect timeout in seconds
    #[arg(long, default_value_t = 4, env = "BODEGA_MONITOR_CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = MonitorArgs::parse();

    println!("Initializing bodega monitor...");
    println!("Initializing fmt subscriber");
    // construct a subscriber that prints formatted traces to stdout
    // if RUST_LOG is not set, defaults to loglevel INFO
    let subscriber = tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_ansi(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("Could not init tracing");

    let task_tracker = TaskTracker::new();
    let token = CancellationToken::new();

    info!("Running telemetry processor");
    let (processor, handle, mqtt_opts) = TelemetryProcessor::new(
        token.clone(),
        TelemetryOptions {
            broker_url: cli.mqtt_url,
            client_id: cli.client_id,
            username: cli.mqtt_username,
            password: cli.mqtt_password,
            data_topic: cli.data_topic,
            reconnect_period: Duration::from_secs(cli.reconnect_secs),
            connect_timeout_secs: cli.connect_timeout_secs,
        },
    );
    let (client, eventloop) = AsyncClient::new(mqtt_opts, 600);
    task_tracker.spawn(processor.process(client, eventloop));
    task_tracker.spawn(report_readings(token.clone(), handle, cli.tank_height_cm));

    task_tracker.close();

    info!("Initialization complete, ready...");
    info!("Use Ctrl+C or SIGINT to exit cleanly!");

    signal::ctrl_c()
        .await
        .expect("Could not read cancellation trigger (ctr+c)");
    info!("Received exit signal, shutting down!");
    token.cancel();
    task_tracker.wait().await;
}

/// Logs every reading change, with the tank level derived from raw
/// ultrasonic messages
async fn report_readings(
    cancel_token: CancellationToken,
    handle: TelemetryHandle,
    tank_height_cm: f64,
) {
    let mut reading_rx = handle.watch_reading();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            },
            changed = reading_rx.changed() => {
                if changed.is_err() {
                    warn!("Telemetry processor gone, stopping reporter");
                    break;
                }
                let reading = reading_rx.borrow_and_update().clone();
                info!(
                    "temperature: {}  humidity: {}",
                    self::display(reading.temperature),
                    self::display(reading.humidity),
                );
                if reading.last_topic == ULTRASONIC_TOPIC {
                    match reading.last_payload.parse::<f64>() {
                        Ok(distance) => info!(
                            "tank level: {:.1}% ({} cm)",
                            fill_percent(distance, tank_height_cm),
                            distance
                        ),
                        Err(_) => warn!("Unparsable ultrasonic payload: {}", reading.last_payload),
                    }
                }
            }
        }
    }
}

/// "--" stands in until a reading has arrived
fn display(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.1}"),
        None => "--".to_string(),
    }
}
