//! Bridge runtime: link supervisor, arbiter, poller, publisher and MQTT.
//!
//! Every task stops on the shared cancellation token. The supervisor owns
//! the arbiter; when the link drops it reopens the connection and resumes
//! the same queue, so commands waiting at the time survive.

use crate::arbiter::{Arbiter, ArbiterExit, OutcomeRecord};
use crate::config::{BridgeConfig, ConfigError};
use crate::link::{self, Link, LinkError};
use crate::mqtt;
use crate::poller::Poller;
use crate::telemetry::StatePublisher;
use rumqttc::AsyncClient;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bridge task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Keep an arbiter running across connection losses.
///
/// `open` is called for each (re)connection. Returns once cancelled, after
/// every queued command has been resolved.
pub async fn supervise<F, Fut>(arbiter: &mut Arbiter, mut open: F, reconnect_delay: Duration, cancel: &CancellationToken)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Box<dyn Link>, LinkError>>,
{
    let mut connections = 0u32;
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = open() => opened,
        };
        match opened {
            Ok(link) => {
                connections += 1;
                match arbiter.run(link, cancel).await {
                    ArbiterExit::Shutdown => {
                        info!(connections, stats = ?arbiter.stats(), "arbiter shut down");
                        return;
                    }
                    ArbiterExit::LinkDown(err) => {
                        warn!(error = %err, ?reconnect_delay, "link lost, reconnecting");
                    }
                }
            }
            Err(err) => error!(error = %err, ?reconnect_delay, "cannot open link"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    arbiter.shutdown();
    info!(connections, stats = ?arbiter.stats(), "arbiter shut down while disconnected");
}

async fn publish_outcomes(
    mut outcomes: mpsc::UnboundedReceiver<OutcomeRecord>,
    mut publisher: StatePublisher,
    client: AsyncClient,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = outcomes.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        for publication in publisher.apply(&record) {
            if let Err(err) = mqtt::publish(&client, &publication).await {
                warn!(topic = %publication.topic, error = %err, "publish failed");
            }
        }
    }
    info!(stats = ?publisher.stats(), "publisher stopped");
}

pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let config = self.config;
        let target = config.link_target()?;
        let directory = config.directory();
        let topics = config.topics();
        let mut settings = config.mqtt_settings();
        settings.reconnect_delay = config.reconnect_delay();

        info!(%target, zones = directory.len(), broker = %settings.host, "starting bridge");

        let (mut arbiter, handle, outcomes) = Arbiter::new(config.arbiter_config());
        let (client, eventloop) = mqtt::connect(&settings);

        let supervisor = {
            let cancel = cancel.clone();
            let reconnect_delay = config.reconnect_delay();
            tokio::spawn(async move {
                let target = &target;
                let open = move || link::open(target, CONNECT_TIMEOUT);
                supervise(&mut arbiter, open, reconnect_delay, &cancel).await;
            })
        };
        let publisher = tokio::spawn(publish_outcomes(
            outcomes,
            StatePublisher::new(topics.clone(), directory.clone()),
            client.clone(),
            cancel.clone(),
        ));
        let poller = tokio::spawn(Poller::new(handle.clone(), directory.clone()).run(config.poll_interval(), cancel.clone()));
        let events = tokio::spawn(mqtt::run_event_loop(
            eventloop,
            client,
            settings,
            topics,
            directory,
            handle,
            cancel,
        ));

        supervisor.await?;
        poller.await?;
        events.await?;
        publisher.await?;
        info!("bridge stopped");
        Ok(())
    }
}
