use crate::config::Config;
use crate::ingest::Accumulator;
use crate::pipeline::PipelineStats;
use crate::telemetry::parse_mqtt_payload;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Subscribes to `<prefix>/+/+` and feeds every decoded message to the accumulator,
/// reconnecting forever.
pub async fn run_listener(
    config: Config,
    accumulator: Accumulator,
    stats: Arc<PipelineStats>,
) -> Result<()> {
    let filter = format!("{}/+/+", config.mqtt_topic_prefix);
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!(topic=%filter, "connected to MQTT broker");
                    stats.set_mqtt_connected(true);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_mqtt_payload(&config.mqtt_topic_prefix, &publish.topic, &mut payload)
                    {
                        Ok(Some(update)) => accumulator.ingest(update).await,
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
