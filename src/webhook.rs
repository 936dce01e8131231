//! Admission webhook resource extractor (spec §2, §9 collaborator stub): surfaces the
//! `/validate` contract only. Decodes an `AdmissionReview`, extracts label/annotation
//! metadata, and enqueues it as an Observability-class row into the same Artifact
//! Store the Collector writes to. Not a full admission controller: every request is
//! allowed, no mutation, no policy evaluation.

use crate::classify::{Sample, StreamClass};
use crate::store::Store;
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AdmissionReview {
    pub request: AdmissionRequest,
}

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub namespace: String,
    #[serde(default)]
    pub object: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
}

#[derive(Debug, Serialize)]
pub struct AdmissionReviewResponse {
    pub response: AdmissionResponse,
}

pub struct WebhookState {
    pub store: Arc<Store>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/validate", post(validate)).with_state(state)
}

async fn validate(State(state): State<Arc<WebhookState>>, Json(review): Json<AdmissionReview>) -> Json<AdmissionReviewResponse> {
    let uid = review.request.uid.clone();
    let mut labels: BTreeMap<String, String> = review.request.object.metadata.labels.clone();
    labels.extend(review.request.object.metadata.annotations.clone());

    let sample = Sample {
        cluster: String::new(),
        cloud_account: String::new(),
        metric_name: "kube_object_metadata".to_string(),
        node: review.request.object.metadata.name.clone().unwrap_or_default(),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        labels,
        value: "1".to_string(),
    };

    if let Err(err) = state.store.put(StreamClass::Observability, vec![sample]) {
        tracing::warn!(%err, namespace = %review.request.namespace, "failed to enqueue webhook metadata row");
    }

    Json(AdmissionReviewResponse {
        response: AdmissionResponse { uid, allowed: true },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_admission_review() {
        let payload = r#"{"request":{"uid":"abc","namespace":"default","object":{"metadata":{"name":"pod-1","labels":{"app":"x"}}}}}"#;
        let review: AdmissionReview = serde_json::from_str(payload).unwrap();
        assert_eq!(review.request.uid, "abc");
        assert_eq!(review.request.object.metadata.labels.get("app").unwrap(), "x");
    }
}
