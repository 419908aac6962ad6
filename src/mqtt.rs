use crate::config::Config;
use crate::control::{parse_svc_action, parse_svc_start};
use crate::processor::RelayProcessor;
use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const RETRY_SUBSCRIBE: Duration = Duration::from_secs(2);
const RETRY_RECONNECT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
enum Feed {
    Control,
    Telemetry,
}

impl Feed {
    fn suffix(self) -> &'static str {
        match self {
            Feed::Control => "control",
            Feed::Telemetry => "telemetry",
        }
    }
}

fn connect(config: &Config, feed: Feed) -> (AsyncClient, EventLoop) {
    let mut mqttoptions = MqttOptions::new(
        format!("{}-{}", config.mqtt_client_id, feed.suffix()),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    mqttoptions.set_max_packet_size(1024 * 1024, 1024 * 1024);
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    AsyncClient::new(mqttoptions, 64)
}

fn set_connected(processor: &RelayProcessor, feed: Feed, connected: bool) {
    let stats = processor.stats();
    match feed {
        Feed::Control => stats.set_control_connected(connected),
        Feed::Telemetry => stats.set_telemetry_connected(connected),
    }
}

async fn subscribe_all(
    client: &AsyncClient,
    topics: &[String],
) -> Result<(), rumqttc::ClientError> {
    for topic in topics {
        client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
        tracing::info!(topic = %topic, "subscribed");
    }
    Ok(())
}

/// Keeps one MQTT connection for `feed` alive until `cancel` fires, passing
/// every publish to `on_publish`.
///
/// Failing to reach the broker before the first ConnAck is an error; once
/// connected, drops are retried indefinitely.
async fn run_feed<F, Fut>(
    config: &Config,
    processor: &RelayProcessor,
    feed: Feed,
    topics: Vec<String>,
    cancel: CancellationToken,
    mut on_publish: F,
) -> Result<()>
where
    F: FnMut(String, Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ever_connected = false;
    loop {
        let (client, mut eventloop) = connect(config, feed);

        // Subscriptions are queued on the client and only go out once the
        // event loop is polled below.
        if let Err(err) = subscribe_all(&client, &topics).await {
            tracing::warn!(
                feed = feed.suffix(),
                error = %err,
                "failed to subscribe to MQTT; retrying"
            );
            set_connected(processor, feed, false);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(RETRY_SUBSCRIBE) => continue,
            }
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    set_connected(processor, feed, false);
                    let _ = client.disconnect().await;
                    tracing::info!(feed = feed.suffix(), "MQTT listener stopping");
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!(feed = feed.suffix(), "connected to MQTT broker");
                    ever_connected = true;
                    set_connected(processor, feed, true);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    on_publish(publish.topic, publish.payload.to_vec()).await;
                }
                Ok(_) => {}
                Err(err) => {
                    set_connected(processor, feed, false);
                    if !ever_connected {
                        return Err(anyhow!(
                            "{} feed could not reach MQTT broker {}:{}: {err}",
                            feed.suffix(),
                            config.mqtt_host,
                            config.mqtt_port
                        ));
                    }
                    tracing::warn!(
                        feed = feed.suffix(),
                        error = %err,
                        "MQTT connection dropped; reconnecting"
                    );
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(RETRY_RECONNECT) => {}
        }
    }
}

/// Session control events: `<prefix>/svc_start` and `<prefix>/svc_action`.
pub async fn run_control_listener(
    config: Config,
    processor: RelayProcessor,
    cancel: CancellationToken,
) -> Result<()> {
    let start_topic = config.svc_start_topic();
    let action_topic = config.svc_action_topic();
    let topics = vec![start_topic.clone(), action_topic.clone()];
    let handler = &processor;
    let (start_topic, action_topic) = (&start_topic, &action_topic);

    run_feed(&config, &processor, Feed::Control, topics, cancel, move |topic, payload| {
        async move {
            if topic == *start_topic {
                if let Some(start) = parse_svc_start(&payload) {
                    handler.handle_svc_start(start).await;
                }
            } else if topic == *action_topic {
                if let Some(action) = parse_svc_action(&payload) {
                    handler.handle_svc_action(action).await;
                }
            } else {
                tracing::warn!(topic = %topic, "message on unexpected control topic");
            }
        }
    })
    .await
}

/// ECG and vitals records sharing the telemetry topic.
pub async fn run_telemetry_listener(
    config: Config,
    processor: RelayProcessor,
    cancel: CancellationToken,
) -> Result<()> {
    let topics = vec![config.telemetry_topic.clone()];
    let handler = &processor;

    run_feed(&config, &processor, Feed::Telemetry, topics, cancel, move |_topic, mut payload| {
        async move {
            handler.route_telemetry(&mut payload).await;
        }
    })
    .await
}
