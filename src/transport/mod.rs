//! MQTT transport feeder (feature `mqtt`).
//!
//! Owns the broker connection so the tracker core never has to: it
//! subscribes on every (re)connect, decodes publishes as JSON, and pumps
//! `(topic, payload)` pairs into the server's ingestion channel. The
//! rumqttc event loop handles reconnection; payloads that are not JSON are
//! dropped here with a debug log.

use crate::config::MqttConfig;
use crate::server::RawMessage;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Spawn the feeder task. It runs until the ingestion channel closes.
pub fn spawn_mqtt_feeder(config: MqttConfig, tx: UnboundedSender<RawMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(std::time::Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        info!(
            "mqtt feeder connecting to {}:{} for {}",
            config.broker, config.port, config.topic
        );

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // Subscriptions do not survive reconnects; re-issue on
                    // every session start.
                    if let Err(e) = client.subscribe(&config.topic, QoS::AtLeastOnce).await {
                        warn!("mqtt subscribe failed: {:?}", e);
                    } else {
                        info!("subscribed to {}", config.topic);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let payload = match serde_json::from_slice::<serde_json::Value>(&publish.payload)
                    {
                        Ok(value) => value,
                        Err(e) => {
                            debug!("non-JSON payload on {}: {}", publish.topic, e);
                            continue;
                        }
                    };
                    let message = RawMessage {
                        topic: publish.topic.clone(),
                        payload,
                    };
                    if tx.send(message).is_err() {
                        info!("ingestion channel closed; stopping mqtt feeder");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt connection error: {:?} (retrying)", e);
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    })
}
