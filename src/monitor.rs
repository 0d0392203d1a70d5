use crate::aggregator::{AggregatorClosed, AggregatorHandle};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

/// Sent right after every successful connection.
pub const SUBSCRIBE_REQUEST: &str =
    r#"{"id":0,"jsonrpc":"2.0","method":"eth_subscribe","params":["newHeads"]}"#;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("WebSocket connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("WebSocket send error: {0}")]
    Send(#[source] tungstenite::Error),

    #[error("WebSocket read error: {0}")]
    Read(#[source] tungstenite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HeadParseError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message carries no block number")]
    MissingNumber,

    #[error("Invalid block number '{value}': {source}")]
    InvalidNumber {
        value: String,
        source: ParseIntError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Height report request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Height report rejected with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Unknown provider index {0}")]
    UnknownProvider(usize),

    #[error(transparent)]
    Aggregator(#[from] AggregatorClosed),
}

/// Destination for `(provider index, height)` observations.
#[async_trait]
pub trait HeadSink: Send + Sync {
    async fn report(&self, index: usize, height: u64) -> Result<(), ReportError>;
}

/// Upper bound on one report round trip. The ingestion endpoint holds a
/// report while an earlier configuration waits for its consumer.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts observations to a remote ingestion endpoint as `{"<index>": <height>}`.
pub struct HttpReporter {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpReporter {
    pub fn new(url: Url) -> Self {
        Self::with_timeout(url, REPORT_TIMEOUT)
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl HeadSink for HttpReporter {
    async fn report(&self, index: usize, height: u64) -> Result<(), ReportError> {
        let body = BTreeMap::from([(index.to_string(), height)]);
        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Rejected { status, body });
        }
        Ok(())
    }
}

/// In-process reporting goes through the same batch path as HTTP reports.
#[async_trait]
impl HeadSink for AggregatorHandle {
    async fn report(&self, index: usize, height: u64) -> Result<(), ReportError> {
        if index >= self.registry().len() {
            return Err(ReportError::UnknownProvider(index));
        }
        AggregatorHandle::report(self, vec![(index, height)]).await?;
        Ok(())
    }
}

/// Parses a block number written in decimal or `0x`-prefixed hex.
pub fn parse_block_number(value: &str) -> Result<u64, ParseIntError> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

/// Extracts the head number from a `newHeads` notification. RPC responses
/// (the subscription confirmation, errors) yield `Ok(None)`.
pub fn parse_notification(text: &str) -> Result<Option<u64>, HeadParseError> {
    let message: Value = serde_json::from_str(text)?;

    match message.pointer("/params/result/number") {
        Some(Value::String(number)) => parse_block_number(number)
            .map(Some)
            .map_err(|source| HeadParseError::InvalidNumber {
                value: number.clone(),
                source,
            }),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(Some)
            .ok_or(HeadParseError::MissingNumber),
        Some(_) => Err(HeadParseError::MissingNumber),
        None if message.get("result").is_some() || message.get("error").is_some() => Ok(None),
        None => Err(HeadParseError::MissingNumber),
    }
}

enum SessionEnd {
    Stopped,
    Closed,
}

/// Follows one provider's chain head over a websocket subscription.
pub struct HeadMonitor {
    index: usize,
    url: String,
    reconnect_delay: Duration,
    sink: Arc<dyn HeadSink>,
}

impl HeadMonitor {
    pub fn new(
        index: usize,
        url: String,
        reconnect_delay: Duration,
        sink: Arc<dyn HeadSink>,
    ) -> Self {
        Self {
            index,
            url,
            reconnect_delay,
            sink,
        }
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// Reconnects forever with a fixed delay until `stop` flips (or its
    /// sender is dropped).
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("Monitoring heads of provider {} at {}", self.index, self.url);

        loop {
            if *stop.borrow() {
                break;
            }

            match self.session(&mut stop).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Closed) => {
                    warn!("Websocket for {} closed by peer", self.url);
                }
                Err(MonitorError::Connect(e)) => {
                    warn!("Failed to dial websockets for {}: {}", self.url, e);
                }
                Err(e) => {
                    warn!("Failed to read message on websockets for {}: {}", self.url, e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = stop.changed() => break,
            }
        }

        info!("Head monitor for provider {} stopped", self.index);
    }

    async fn session(&self, stop: &mut watch::Receiver<bool>) -> Result<SessionEnd, MonitorError> {
        let (stream, _) = tokio::select! {
            connected = connect_async(self.url.as_str()) => {
                connected.map_err(MonitorError::Connect)?
            }
            _ = stop.changed() => return Ok(SessionEnd::Stopped),
        };
        debug!("Connected to {}", self.url);

        // Dropping both halves on return is the only close path.
        let (mut write, mut read) = stream.split();
        write
            .send(Message::Text(SUBSCRIBE_REQUEST.to_string().into()))
            .await
            .map_err(MonitorError::Send)?;

        loop {
            let message = tokio::select! {
                message = read.next() => message,
                _ = stop.changed() => return Ok(SessionEnd::Stopped),
            };

            let text = match message {
                None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                Some(Err(e)) => return Err(MonitorError::Read(e)),
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => text.to_owned(),
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame from {}", self.url);
                        continue;
                    }
                },
                Some(Ok(_)) => continue,
            };

            tokio::select! {
                _ = self.handle_text(&text) => {}
                _ = stop.changed() => return Ok(SessionEnd::Stopped),
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        debug!("Msg from {}: {}", self.url, text);

        match parse_notification(text) {
            Ok(Some(height)) => {
                if let Err(e) = self.sink.report(self.index, height).await {
                    warn!(
                        "Failed to report height {} for provider {}: {}",
                        height, self.index, e
                    );
                }
            }
            Ok(None) => debug!("Subscription response from {}: {}", self.url, text),
            Err(e) => warn!("Error parsing number from head of {}: {}", self.url, e),
        }
    }
}

/// Provider record as served by the ingestion endpoint's `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProvider {
    #[serde(default)]
    pub wsurl: Option<String>,
}

/// Fetches the provider list; array position is the report index.
pub async fn fetch_providers(url: &Url) -> Result<Vec<RemoteProvider>, reqwest::Error> {
    reqwest::get(url.clone())
        .await?
        .error_for_status()?
        .json()
        .await
}

/// Spawns one monitor per provider that has a websocket URL.
pub fn spawn_monitors<I>(
    providers: I,
    reconnect_delay: Duration,
    sink: Arc<dyn HeadSink>,
    stop: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    I: IntoIterator<Item = (usize, Option<String>)>,
{
    providers
        .into_iter()
        .filter_map(|(index, wsurl)| {
            let Some(wsurl) = wsurl else {
                debug!("Provider {} has no websocket URL, not monitoring", index);
                return None;
            };
            let monitor = HeadMonitor::new(index, wsurl, reconnect_delay, sink.clone());
            Some(monitor.spawn(stop.clone()))
        })
        .collect()
}
