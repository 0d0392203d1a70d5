use crate::generator::RoutingConfiguration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Configuration consumer is gone")]
    ConsumerGone,
}

/// Delivers generated configurations to whatever applies them.
#[async_trait]
pub trait ConfigPublisher: Send + Sync {
    /// Resolves once the consumer has taken `configuration`.
    async fn publish(&self, configuration: RoutingConfiguration) -> Result<(), PublishError>;
}

struct Delivery {
    configuration: RoutingConfiguration,
    taken: oneshot::Sender<()>,
}

/// Producer half of the hand-off channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Delivery>,
}

/// Consumer half of the hand-off channel.
pub struct ConfigReceiver {
    rx: mpsc::Receiver<Delivery>,
}

/// Creates a rendezvous channel: `publish` only returns after the matching
/// `recv`, so at most one configuration is ever in flight.
pub fn handoff() -> (ChannelPublisher, ConfigReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ChannelPublisher { tx }, ConfigReceiver { rx })
}

#[async_trait]
impl ConfigPublisher for ChannelPublisher {
    async fn publish(&self, configuration: RoutingConfiguration) -> Result<(), PublishError> {
        let (taken, accepted) = oneshot::channel();
        self.tx
            .send(Delivery {
                configuration,
                taken,
            })
            .await
            .map_err(|_| PublishError::ConsumerGone)?;
        accepted.await.map_err(|_| PublishError::ConsumerGone)
    }
}

impl ConfigReceiver {
    /// Takes the next configuration, releasing the blocked publisher.
    pub async fn recv(&mut self) -> Option<RoutingConfiguration> {
        let delivery = self.rx.recv().await?;
        let _ = delivery.taken.send(());
        Some(delivery.configuration)
    }
}

/// Bundled consumer: writes each configuration to `output` (atomically, via
/// a sibling temp file) or logs it when no output is configured.
pub async fn run_consumer(
    mut receiver: ConfigReceiver,
    output: Option<PathBuf>,
    mut stop: watch::Receiver<bool>,
) {
    match &output {
        Some(path) => info!("Writing routing configuration to {:?}", path),
        None => info!("No publisher output configured, logging configurations"),
    }

    loop {
        let configuration = tokio::select! {
            configuration = receiver.recv() => configuration,
            _ = stop.changed() => break,
        };
        let Some(configuration) = configuration else {
            break;
        };

        match &output {
            Some(path) => {
                if let Err(e) = write_atomically(path, &configuration).await {
                    error!("Failed to write routing configuration: {:#}", e);
                }
            }
            None => match serde_json::to_string(&configuration) {
                Ok(json) => debug!("Config: {}", json),
                Err(e) => error!("Failed to serialize routing configuration: {}", e),
            },
        }
    }

    info!("Configuration consumer stopped");
}

pub async fn write_atomically(path: &Path, configuration: &RoutingConfiguration) -> Result<()> {
    let json = serde_json::to_vec_pretty(configuration)
        .context("Failed to serialize routing configuration")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, &json)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_blocks_until_taken() {
        let (publisher, mut receiver) = handoff();

        let pending = tokio::spawn(async move {
            publisher
                .publish(RoutingConfiguration::default())
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(receiver.recv().await, Some(RoutingConfiguration::default()));
        timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_fails_without_consumer() {
        let (publisher, receiver) = handoff();
        drop(receiver);

        let result = publisher.publish(RoutingConfiguration::default()).await;
        assert!(matches!(result, Err(PublishError::ConsumerGone)));
    }

    #[tokio::test]
    async fn test_consumer_writes_file() {
        let path = std::env::temp_dir().join(format!("head-router-{}.json", std::process::id()));
        let (publisher, receiver) = handoff();
        let (stop_tx, stop_rx) = watch::channel(false);
        let consumer = tokio::spawn(run_consumer(receiver, Some(path.clone()), stop_rx));

        publisher
            .publish(RoutingConfiguration::default())
            .await
            .unwrap();
        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(written["http"]["routers"].as_object().unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
