//! MQTT side of the bridge, built on rumqttc.
//!
//! The event loop task subscribes and announces discovery on every ConnAck,
//! and turns each inbound control message into one submitted command.

use crate::arbiter::ArbiterHandle;
use crate::control::parse_control;
use crate::telemetry::{control_rejection, Publication};
use crate::topics::TopicScheme;
use crate::zone::ZoneDirectory;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    /// Pause after a connection error before the event loop retries.
    pub reconnect_delay: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hmbus".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub fn connect(settings: &MqttSettings) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let Some((username, password)) = &settings.credentials {
        options.set_credentials(username.clone(), password.clone());
    }
    AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY)
}

pub async fn publish(client: &AsyncClient, publication: &Publication) -> Result<(), ClientError> {
    client
        .publish(
            publication.topic.clone(),
            QoS::AtLeastOnce,
            publication.retain,
            publication.payload.clone().into_bytes(),
        )
        .await
}

/// Subscribe to control topics and publish retained discovery documents.
pub async fn announce(client: AsyncClient, scheme: TopicScheme, directory: ZoneDirectory) -> Result<(), ClientError> {
    client.subscribe(scheme.control_filter(), QoS::AtLeastOnce).await?;
    for zone in directory.zones() {
        let (topic, document) = scheme.climate_discovery(zone);
        client.publish(topic, QoS::AtLeastOnce, true, document.to_string()).await?;
    }
    if let Some(relay) = directory.hotwater() {
        let (topic, document) = scheme.hotwater_discovery(relay);
        client.publish(topic, QoS::AtLeastOnce, true, document.to_string()).await?;
    }
    info!(zones = directory.len(), hotwater = directory.hotwater().is_some(), "discovery published");
    Ok(())
}

/// Drive the MQTT connection until cancelled.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    settings: MqttSettings,
    scheme: TopicScheme,
    directory: ZoneDirectory,
    arbiter: ArbiterHandle,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(host = %settings.host, port = settings.port, code = ?ack.code, "connected to broker");
                // Announce from a separate task; the request channel drains only while we poll.
                let (client, scheme, directory) = (client.clone(), scheme.clone(), directory.clone());
                tokio::spawn(async move {
                    if let Err(err) = announce(client, scheme, directory).await {
                        warn!(error = %err, "could not announce");
                    }
                });
            }
            Ok(Event::Incoming(Packet::Publish(message))) => {
                let payload = String::from_utf8_lossy(&message.payload);
                info!(topic = %message.topic, payload = %payload, "control message");
                match parse_control(&message.topic, &payload, &directory, &scheme) {
                    Ok(command) => {
                        let handle = arbiter.submit(command);
                        debug!(id = %handle.id(), queued = arbiter.queued(), "control command submitted");
                    }
                    Err(err) => {
                        warn!(topic = %message.topic, error = %err, "ignoring control message");
                        // The request channel only drains while this loop polls; never await it here.
                        if let Some(rejection) = control_rejection(&scheme, &message.topic, &payload, &err) {
                            if let Err(err) =
                                client.try_publish(rejection.topic, QoS::AtLeastOnce, rejection.retain, rejection.payload)
                            {
                                debug!(error = %err, "rejection not queued");
                            }
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "mqtt connection error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                }
            }
        }
    }
    if let Err(err) = client.try_disconnect() {
        debug!(error = %err, "disconnect request not queued");
    }
    info!("mqtt event loop stopped");
}
