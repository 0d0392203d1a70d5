use crate::generator::Generator;
use crate::metrics::MetricsCollector;
use crate::publisher::ConfigPublisher;
use crate::registry::{Provider, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Highest block height ever accepted per group. Never decreases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeightState {
    heights: BTreeMap<String, u64>,
}

impl HeightState {
    pub fn get(&self, group: &str) -> Option<u64> {
        self.heights.get(group).copied()
    }

    /// Applies a `ReportHeight` event. Returns `false` when the report is
    /// below the stored maximum and was discarded.
    pub fn report(&mut self, group: &str, value: u64) -> bool {
        match self.heights.get_mut(group) {
            Some(current) if value < *current => false,
            Some(current) => {
                *current = value;
                true
            }
            None => {
                self.heights.insert(group.to_string(), value);
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.heights.iter().map(|(group, height)| (group.as_str(), *height))
    }
}

/// A provider record together with the last height it reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub provider: Provider,
    pub latest_block: Option<u64>,
}

#[derive(Debug)]
enum Event {
    Report {
        batch: Vec<(usize, u64)>,
        applied: oneshot::Sender<()>,
    },
    Refresh,
    Snapshot(oneshot::Sender<Vec<ProviderStatus>>),
}

#[derive(Debug, thiserror::Error)]
#[error("Height aggregator is not running")]
pub struct AggregatorClosed;

/// Cloneable front door to the aggregator. Every state change goes through it.
#[derive(Clone)]
pub struct AggregatorHandle {
    events: mpsc::UnboundedSender<Event>,
    registry: Arc<Registry>,
}

impl AggregatorHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Submits a validated batch of `(provider index, height)` observations
    /// and waits until the aggregator has applied it.
    pub async fn report(&self, batch: Vec<(usize, u64)>) -> Result<(), AggregatorClosed> {
        let (applied, done) = oneshot::channel();
        self.events
            .send(Event::Report { batch, applied })
            .map_err(|_| AggregatorClosed)?;
        done.await.map_err(|_| AggregatorClosed)
    }

    /// Forces a regeneration without a height change.
    pub fn refresh(&self) -> Result<(), AggregatorClosed> {
        self.events.send(Event::Refresh).map_err(|_| AggregatorClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<ProviderStatus>, AggregatorClosed> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::Snapshot(reply))
            .map_err(|_| AggregatorClosed)?;
        response.await.map_err(|_| AggregatorClosed)
    }
}

/// Single owner of provider heights and [`HeightState`]. Events are handled
/// one at a time, in arrival order.
pub struct Aggregator {
    generator: Generator,
    publisher: Box<dyn ConfigPublisher>,
    metrics: Option<Arc<MetricsCollector>>,
    events: mpsc::UnboundedReceiver<Event>,
    latest: Vec<Option<u64>>,
    heights: HeightState,
    skip_unchanged: bool,
    last_published: Option<Vec<u8>>,
    regenerations: u64,
}

impl Aggregator {
    pub fn new(
        generator: Generator,
        publisher: Box<dyn ConfigPublisher>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = generator.registry().clone();

        let aggregator = Self {
            latest: vec![None; registry.len()],
            generator,
            publisher,
            metrics,
            events: rx,
            heights: HeightState::default(),
            skip_unchanged: false,
            last_published: None,
            regenerations: 0,
        };
        let handle = AggregatorHandle {
            events: tx,
            registry,
        };
        (aggregator, handle)
    }

    /// Skip the hand-off when a regeneration is byte-identical to the last
    /// published configuration.
    pub fn with_skip_unchanged(mut self, enabled: bool) -> Self {
        self.skip_unchanged = enabled;
        self
    }

    /// Runs the loop on its own task. A panic inside the loop is logged at
    /// this boundary and only stops the aggregator.
    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = tokio::spawn(self.run(stop));
        tokio::spawn(async move {
            match inner.await {
                Ok(()) => info!("Height aggregator stopped"),
                Err(e) if e.is_panic() => error!("Height aggregator crashed: {}", e),
                Err(e) => warn!("Height aggregator cancelled: {}", e),
            }
        })
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            "Height aggregator started for {} providers",
            self.latest.len()
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let event = tokio::select! {
                event = self.events.recv() => event,
                changed = stop.changed() => {
                    // A dropped stop sender means the process is going away.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(event) = event else {
                break;
            };

            let keep_running = match event {
                Event::Report { batch, applied } => {
                    let dirty = self.apply(batch);
                    let _ = applied.send(());
                    if dirty {
                        self.regenerate(&mut stop).await
                    } else {
                        true
                    }
                }
                Event::Refresh => self.regenerate(&mut stop).await,
                Event::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                    true
                }
            };

            if !keep_running {
                break;
            }
        }
    }

    /// Records a batch and feeds each touched group's batch maximum through
    /// [`HeightState::report`]. Returns whether any group advanced.
    fn apply(&mut self, batch: Vec<(usize, u64)>) -> bool {
        let registry = self.generator.registry().clone();
        let mut maxima: BTreeMap<&str, u64> = BTreeMap::new();

        for (index, height) in batch {
            let (Some(provider), Some(latest)) =
                (registry.provider(index), self.latest.get_mut(index))
            else {
                warn!("Ignoring height report for unknown provider {}", index);
                continue;
            };

            if latest.is_none_or(|current| height > current) {
                *latest = Some(height);
            } else if latest.is_some_and(|current| height < current) {
                debug!(
                    "Provider {} reported {} below its recorded {:?}",
                    index, height, latest
                );
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_report(index, latest.unwrap_or(height));
            }

            let max = maxima.entry(provider.group.as_str()).or_insert(height);
            *max = (*max).max(height);
        }

        let mut dirty = false;
        for (group, max) in maxima {
            if self.heights.report(group, max) {
                dirty = true;
                debug!("Service '{}' height is now {}", group, max);
                if let Some(metrics) = &self.metrics {
                    metrics.update_group_height(group, max);
                }
            } else {
                debug!(
                    "Discarding stale report {} for service '{}' (current {:?})",
                    max,
                    group,
                    self.heights.get(group)
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_stale_report();
                }
            }
        }

        dirty
    }

    /// Regenerates and hands the result to the publisher. Returns `false`
    /// when the stop signal fired while waiting for the consumer.
    async fn regenerate(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        let generation = self.generator.generate(&self.latest, &self.heights);
        self.regenerations += 1;

        if let Some(metrics) = &self.metrics {
            metrics.record_regeneration(generation.degraded.len());
        }

        if self.skip_unchanged {
            match serde_json::to_vec(&generation.configuration) {
                Ok(bytes) if self.last_published.as_ref() == Some(&bytes) => {
                    debug!(
                        "Regeneration #{} is unchanged, skipping publish",
                        self.regenerations
                    );
                    return true;
                }
                Ok(bytes) => self.last_published = Some(bytes),
                Err(e) => warn!("Failed to serialize configuration: {}", e),
            }
        }

        info!(
            "Publishing configuration #{} ({} routes, {} degraded)",
            self.regenerations,
            generation.configuration.http.routers.len(),
            generation.degraded.len()
        );

        tokio::select! {
            result = self.publisher.publish(generation.configuration) => {
                if let Err(e) = result {
                    error!("Failed to publish configuration: {}", e);
                }
                true
            }
            _ = stop.changed() => false,
        }
    }

    fn snapshot(&self) -> Vec<ProviderStatus> {
        self.generator
            .registry()
            .providers()
            .iter()
            .map(|provider| ProviderStatus {
                provider: provider.clone(),
                latest_block: self.latest[provider.index],
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::publisher::{ConfigReceiver, handoff};
    use crate::registry::tests::{method, provider, uniform};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Aggregator over group "eth" with the given number of providers.
    pub(crate) fn start(
        providers: usize,
    ) -> (AggregatorHandle, ConfigReceiver, watch::Sender<bool>) {
        let mut services = BTreeMap::new();
        services.insert(
            "eth".to_string(),
            uniform(
                (0..providers)
                    .map(|i| provider(&format!("http://node-{}:8545", i)))
                    .collect(),
                vec![method("eth_blockNumber")],
            ),
        );
        let registry = Arc::new(Registry::load(&services).unwrap());
        let generator = Generator::new(registry, RoutingConfig::default());
        let (publisher, receiver) = handoff();
        let (aggregator, handle) = Aggregator::new(generator, Box::new(publisher), None);
        let (stop_tx, stop_rx) = watch::channel(false);
        aggregator.spawn(stop_rx);
        (handle, receiver, stop_tx)
    }

    #[test]
    fn test_height_state_is_monotonic() {
        let mut state = HeightState::default();
        assert_eq!(state.get("eth"), None);

        let reports = [5, 9, 3, 9, 12, 11, 0];
        let mut accepted_max = 0;
        for value in reports {
            let before = state.get("eth");
            let accepted = state.report("eth", value);
            assert_eq!(accepted, before.is_none_or(|b| value >= b));
            if accepted {
                accepted_max = accepted_max.max(value);
            }
            assert!(state.get("eth") >= before);
        }
        assert_eq!(state.get("eth"), Some(accepted_max));
        assert_eq!(state.get("eth"), Some(12));
    }

    #[test]
    fn test_equal_report_is_accepted() {
        let mut state = HeightState::default();
        assert!(state.report("eth", 10));
        assert!(state.report("eth", 10));
        assert!(!state.report("eth", 9));
        assert_eq!(state.iter().collect::<Vec<_>>(), vec![("eth", 10)]);
    }

    #[tokio::test]
    async fn test_batch_updates_providers_and_triggers_one_regeneration() {
        let (handle, mut receiver, _stop) = start(2);

        handle.report(vec![(0, 100), (1, 150)]).await.unwrap();

        let configuration = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let servers: Vec<&str> = configuration.http.services["eth-eth_blockNumber"]
            .servers()
            .collect();
        assert_eq!(servers, vec!["http://node-1:8545"]);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].latest_block, Some(100));
        assert_eq!(snapshot[1].latest_block, Some(150));

        assert!(
            timeout(Duration::from_millis(100), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stale_batch_does_not_regenerate() {
        let (handle, mut receiver, _stop) = start(2);

        handle.report(vec![(0, 200)]).await.unwrap();
        receiver.recv().await.unwrap();

        handle.report(vec![(1, 150)]).await.unwrap();
        assert!(
            timeout(Duration::from_millis(100), receiver.recv())
                .await
                .is_err()
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1].latest_block, Some(150));
    }

    #[tokio::test]
    async fn test_provider_height_never_regresses() {
        let (handle, mut receiver, _stop) = start(1);

        handle.report(vec![(0, 50)]).await.unwrap();
        receiver.recv().await.unwrap();
        handle.report(vec![(0, 40)]).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].latest_block, Some(50));
    }

    #[tokio::test]
    async fn test_refresh_publishes_before_any_report() {
        let (handle, mut receiver, _stop) = start(2);

        handle.refresh().unwrap();
        let configuration = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            configuration.http.services["eth-eth_blockNumber"]
                .servers()
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_reports_queue_behind_pending_handoff() {
        let (handle, mut receiver, _stop) = start(2);

        timeout(Duration::from_secs(1), handle.report(vec![(0, 100)]))
            .await
            .unwrap()
            .unwrap();

        // The first configuration has not been taken, so the next batch waits.
        let queued = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(vec![(1, 200)]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!queued.is_finished());

        let first = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first.http.services["eth-eth_blockNumber"]
                .servers()
                .collect::<Vec<_>>(),
            vec!["http://node-0:8545"]
        );

        timeout(Duration::from_secs(1), queued)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            second.http.services["eth-eth_blockNumber"]
                .servers()
                .collect::<Vec<_>>(),
            vec!["http://node-1:8545"]
        );
    }

    #[tokio::test]
    async fn test_stop_signal_ends_aggregator() {
        let (handle, _receiver, stop) = start(1);

        stop.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.snapshot().await.is_err());
    }
}
