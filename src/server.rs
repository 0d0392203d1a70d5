use crate::aggregator::AggregatorHandle;
use crate::metrics::MetricsCollector;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Why an inbound height report was refused.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Bad body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Bad body: provider key '{0}' is not an index")]
    BadIndex(String),

    #[error("Bad body: no provider with index {0}")]
    UnknownProvider(usize),
}

/// Decodes and validates a `{"<provider index>": <height>}` body in full,
/// before anything is applied.
pub fn decode_report(body: &[u8], providers: usize) -> Result<Vec<(usize, u64)>, IngestError> {
    let entries: BTreeMap<String, u64> = serde_json::from_slice(body)?;

    entries
        .into_iter()
        .map(|(key, height)| {
            let index: usize = key.parse().map_err(|_| IngestError::BadIndex(key.clone()))?;
            if index >= providers {
                return Err(IngestError::UnknownProvider(index));
            }
            Ok((index, height))
        })
        .collect()
}

/// `GET /` lists providers, `POST /` ingests height reports and, when
/// metrics are given, `GET /metrics` exports them.
pub fn routes(
    aggregator: AggregatorHandle,
    metrics: Option<Arc<MetricsCollector>>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let with_aggregator = warp::any().map(move || aggregator.clone());
    let with_metrics = warp::any().map(move || metrics.clone());

    let list = warp::path::end()
        .and(warp::get())
        .and(with_aggregator.clone())
        .and_then(list_providers);

    let ingest = warp::path::end()
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_aggregator)
        .and(with_metrics.clone())
        .and_then(ingest_report);

    let export = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_metrics)
        .and_then(export_metrics);

    list.or(ingest).unify().or(export).unify()
}

async fn list_providers(aggregator: AggregatorHandle) -> Result<Response, Infallible> {
    Ok(match aggregator.snapshot().await {
        Ok(providers) => warp::reply::json(&providers).into_response(),
        Err(e) => internal_error(e.to_string()),
    })
}

async fn ingest_report(
    body: Bytes,
    aggregator: AggregatorHandle,
    metrics: Option<Arc<MetricsCollector>>,
) -> Result<Response, Infallible> {
    let batch = match decode_report(&body, aggregator.registry().len()) {
        Ok(batch) => batch,
        Err(e) => {
            warn!("Rejecting height report: {}", e);
            if let Some(metrics) = &metrics {
                metrics.record_rejected_report();
            }
            return Ok(internal_error(e.to_string()));
        }
    };

    Ok(match aggregator.report(batch).await {
        Ok(()) => warp::reply::with_header(r#"{"ok": true}"#, "content-type", "application/json")
            .into_response(),
        Err(e) => internal_error(e.to_string()),
    })
}

async fn export_metrics(metrics: Option<Arc<MetricsCollector>>) -> Result<Response, Rejection> {
    let Some(metrics) = metrics else {
        return Err(warp::reject::not_found());
    };
    Ok(match metrics.export_metrics() {
        Ok(output) => output.into_response(),
        Err(e) => internal_error(e.to_string()),
    })
}

fn internal_error(message: String) -> Response {
    warp::reply::with_status(message, StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

/// Binds the ingestion listener and returns the bound address plus the
/// server future, which resolves after `shutdown` completes.
pub fn bind(
    addr: SocketAddr,
    aggregator: AggregatorHandle,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let (bound, server) = warp::serve(routes(aggregator, metrics))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .with_context(|| format!("Failed to bind ingestion server on {}", addr))?;
    info!("Height report ingestion listening on {}", bound);
    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::start;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_decode_validates_whole_batch() {
        assert_eq!(
            decode_report(br#"{"0": 100, "1": 150}"#, 2).unwrap(),
            vec![(0, 100), (1, 150)]
        );
        assert!(matches!(
            decode_report(br#"{"0": 100, "x": 100}"#, 2),
            Err(IngestError::BadIndex(ref key)) if key == "x"
        ));
        assert!(matches!(
            decode_report(br#"{"-1": 100}"#, 2),
            Err(IngestError::BadIndex(_))
        ));
        assert!(matches!(
            decode_report(br#"{"2": 100}"#, 2),
            Err(IngestError::UnknownProvider(2))
        ));
        assert!(matches!(
            decode_report(br#"{"0": -5}"#, 2),
            Err(IngestError::Malformed(_))
        ));
        assert!(matches!(
            decode_report(b"[1, 2]", 2),
            Err(IngestError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_post_round_trip() {
        let (handle, mut receiver, _stop) = start(2);
        let filter = routes(handle.clone(), None);

        let response = warp::test::request()
            .method("POST")
            .path("/")
            .body(r#"{"0": 100, "1": 150}"#)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), br#"{"ok": true}"#);

        let configuration = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let servers: Vec<&str> = configuration.http.services["eth-eth_blockNumber"]
            .servers()
            .collect();
        assert_eq!(servers, vec!["http://node-1:8545"]);
        assert!(
            timeout(Duration::from_millis(100), receiver.recv())
                .await
                .is_err()
        );

        let response = warp::test::request()
            .method("GET")
            .path("/")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let providers: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(providers[0]["latestBlock"], 100);
        assert_eq!(providers[1]["latestBlock"], 150);
        assert_eq!(providers[1]["group"], "eth");
        assert_eq!(providers[1]["url"], "http://node-1:8545");
    }

    #[tokio::test]
    async fn test_malformed_body_changes_nothing() {
        let (handle, mut receiver, _stop) = start(2);
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let filter = routes(handle.clone(), Some(metrics.clone()));

        for body in [r#"{"x": 100}"#, r#"{"0": 7, "x": 100}"#, r#"{"9": 1}"#, "nope"] {
            let response = warp::test::request()
                .method("POST")
                .path("/")
                .body(body)
                .reply(&filter)
                .await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(String::from_utf8_lossy(response.body()).starts_with("Bad body"));
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.iter().all(|p| p.latest_block.is_none()));
        assert_eq!(metrics.rejected_reports_total.get(), 4);
        assert!(
            timeout(Duration::from_millis(100), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (handle, _receiver, _stop) = start(1);

        let disabled = routes(handle.clone(), None);
        let response = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&disabled)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let enabled = routes(handle, Some(Arc::new(MetricsCollector::new().unwrap())));
        let response = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&enabled)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8_lossy(response.body());
        assert!(body.contains("head_router_regenerations_total"));
    }
}
