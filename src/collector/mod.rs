//! Collector (spec §4.3): the remote-write endpoint. Decompresses and decodes a
//! Prometheus `WriteRequest`, classifies and batches samples into the Artifact Store,
//! and exposes health/readiness. Grounded on node-forwarder/src/http.rs's axum
//! router + `HttpState` pattern, generalized from a single `/v1/samples` route to the
//! remote-write ingest contract plus backpressure.

use crate::classify::{Classifier, Sample, StreamClass};
use crate::diagnostics::Health;
use crate::remote_write::WriteRequest;
use crate::store::Store;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use prost::Message;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub struct CollectorState {
    pub store: Arc<Store>,
    pub classifier: Arc<Classifier>,
    pub health: Arc<Health>,
    pub max_records: u64,
    pub reconnect_frequency: u32,
}

pub fn router(state: Arc<CollectorState>) -> Router {
    Router::new()
        .route("/api/v1/push", post(push))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<CollectorState>>) -> Response {
    let report = state.health.readiness();
    if report.ready {
        (StatusCode::OK, axum::Json(report)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, axum::Json(report)).into_response()
    }
}

/// In-memory backpressure threshold: 2x max_records total buffered rows (spec §4.3).
fn over_backpressure_budget(state: &CollectorState) -> bool {
    state.store.in_memory_row_count() >= state.max_records.saturating_mul(2)
}

async fn push(State(state): State<Arc<CollectorState>>, headers: HeaderMap, body: Bytes) -> Response {
    if state.health.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let usage = state.store.usage().ok();
    let hard_pressure = usage.map(|u| u.used_fraction() >= crate::store::HARD_PRESSURE).unwrap_or(false);
    if hard_pressure || over_backpressure_budget(&state) {
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, "backpressure").into_response();
        resp.headers_mut().insert("Retry-After", "5".parse().unwrap());
        return resp;
    }

    if headers.get("content-encoding").and_then(|v| v.to_str().ok()) != Some("snappy") {
        return (StatusCode::BAD_REQUEST, "expected Content-Encoding: snappy").into_response();
    }

    let decompressed = match snap::raw::Decoder::new().decompress_vec(&body) {
        Ok(d) => d,
        Err(err) => {
            warn!(%err, "failed to snappy-decompress remote-write body");
            return (StatusCode::BAD_REQUEST, "malformed snappy payload").into_response();
        }
    };

    let write_request = match WriteRequest::decode(decompressed.as_slice()) {
        Ok(w) => w,
        Err(err) => {
            warn!(%err, "failed to decode WriteRequest protobuf");
            return (StatusCode::BAD_REQUEST, "malformed protobuf payload").into_response();
        }
    };

    let mut by_class: std::collections::HashMap<StreamClass, Vec<Sample>> = std::collections::HashMap::new();
    for series in write_request.timeseries {
        let mut labels: std::collections::BTreeMap<String, String> = series.labels.iter().map(|l| (l.name.clone(), l.value.clone())).collect();
        let metric_name = labels.remove("__name__").unwrap_or_default();
        let node = labels.get("node").cloned().unwrap_or_default();
        let cluster = labels.get("cluster").cloned().unwrap_or_default();
        let cloud_account = labels.get("cloud_account").cloned().unwrap_or_default();

        for point in series.samples {
            let sample = Sample {
                cluster: cluster.clone(),
                cloud_account: cloud_account.clone(),
                metric_name: metric_name.clone(),
                node: node.clone(),
                timestamp_ms: point.timestamp,
                labels: labels.clone(),
                value: point.value.to_string(),
            };
            if let Some((class, masked)) = state.classifier.classify(sample) {
                by_class.entry(class).or_default().push(masked);
            }
        }
    }

    for (class, samples) in by_class {
        if let Err(err) = state.store.put(class, samples) {
            warn!(%err, "failed to buffer samples, rotation likely failing");
            return (StatusCode::INTERNAL_SERVER_ERROR, "store write failed").into_response();
        }
    }

    let mut resp = StatusCode::NO_CONTENT.into_response();
    if should_reconnect(state.reconnect_frequency) {
        resp.headers_mut().insert("Connection", "close".parse().unwrap());
    }
    resp
}

/// On accepting a connection, with probability `1/reconnect_frequency` ask the client
/// to close after this response, to spread load across replicas (spec §4.3). `0`
/// means never close (spec §9 open question, resolved per the inline comment it cites).
pub fn should_reconnect(reconnect_frequency: u32) -> bool {
    if reconnect_frequency == 0 {
        return false;
    }
    rand::random::<u32>().is_multiple_of(reconnect_frequency)
}

pub async fn run_drain(state: Arc<CollectorState>, grace: std::time::Duration, storage_path: &std::path::Path) -> crate::error::Result<()> {
    state.health.begin_shutdown();
    tokio::time::sleep(grace).await;
    state.store.flush()?;
    let marker = storage_path.join("collector-shutdown-complete");
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new().create(true).write(true).truncate(true).mode(0o600).open(&marker)?;
    f.write_all(b"")?;
    info!("collector drained and wrote shutdown-complete marker");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_never_fires_when_frequency_zero() {
        for _ in 0..100 {
            assert!(!should_reconnect(0));
        }
    }

    #[test]
    fn reconnect_always_fires_when_frequency_one() {
        for _ in 0..20 {
            assert!(should_reconnect(1));
        }
    }
}
