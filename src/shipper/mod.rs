//! Shipper (spec §4.4): discovers sealed artifacts, presigns and uploads them,
//! answers server replay requests, and runs the housekeeper purge loop. Grounded on
//! node-forwarder/src/mqtt.rs's reconnect/replay loop and
//! `examples/other_examples/.../shipper.rs`'s retry/error-classification shape,
//! adapted from MQTT republish and a spool-file source to presigned-URL HTTP PUT and
//! an Artifact Store source.

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::path::{build_key, KeyParams};
use crate::store::{PurgePolicy, Store};
use crate::tracker::Tracker;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct PresignRequestBody {
    shipper_id: String,
    refs: Vec<PresignRef>,
}

#[derive(Debug, Serialize)]
struct PresignRef {
    reference_id: Uuid,
    key: String,
    size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct PresignResponseBody {
    urls: Vec<PresignedUrl>,
    #[serde(default)]
    replay: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Clone)]
struct PresignedUrl {
    reference_id: Uuid,
    put_url: String,
    #[allow(dead_code)]
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of one upload attempt, mirroring the retry classification in
/// `examples/other_examples/.../shipper.rs`'s `ShipResult`.
#[derive(Debug)]
enum PutOutcome {
    Ok,
    Retryable(String),
    Expired,
    NonRetryable(String),
}

pub struct Shipper {
    config: Arc<Config>,
    store: Arc<Store>,
    tracker: Arc<Tracker>,
    client: Client,
    shipper_id: String,
    api_key: Arc<std::sync::RwLock<String>>,
}

impl Shipper {
    pub fn new(config: Arc<Config>, store: Arc<Store>, tracker: Arc<Tracker>, shipper_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.cloudzero.send_timeout)
            .build()
            .map_err(|err| AgentError::Io(std::io::Error::other(err)))?;
        let api_key = read_api_key(&config.cloudzero.api_key_path).unwrap_or_default();
        Ok(Self {
            config,
            store,
            tracker,
            client,
            shipper_id,
            api_key: Arc::new(std::sync::RwLock::new(api_key)),
        })
    }

    pub fn reload_api_key(&self) {
        if let Some(key) = read_api_key(&self.config.cloudzero.api_key_path) {
            *self.api_key.write().expect("api key lock poisoned") = key;
        }
    }

    fn api_key(&self) -> String {
        self.api_key.read().expect("api key lock poisoned").clone()
    }

    /// List `new/` sorted by closedAt ascending (spec §4.4).
    pub fn discover_new(&self) -> Result<Vec<crate::store::ArtifactMeta>> {
        self.store.list(crate::store::NEW_DIR)
    }

    fn scheme_host(&self) -> String {
        let scheme = if self.config.cloudzero.use_http { "http" } else { "https" };
        format!("{scheme}://{}", self.config.cloudzero.host)
    }

    async fn request_presigned_urls(&self, refs: &[crate::store::ArtifactMeta]) -> Result<PresignResponseBody> {
        let body = PresignRequestBody {
            shipper_id: self.shipper_id.clone(),
            refs: refs
                .iter()
                .map(|m| PresignRef {
                    reference_id: m.reference_id,
                    key: build_key(&KeyParams {
                        organization_id: &self.config.organization_id,
                        cloud_account_id: &self.config.cloud_account_id,
                        cluster_name: &self.config.cluster_name,
                        shipper_id: &self.shipper_id,
                        region: &self.config.region,
                        reference_id: m.reference_id,
                        closed_at: m.closed_at,
                    }),
                    size_bytes: std::fs::metadata(&m.path).map(|md| md.len()).unwrap_or(0),
                })
                .collect(),
        };

        let url = format!(
            "{}/v1/container-metrics/upload?cluster_name={}&cloud_account_id={}&region={}",
            self.scheme_host(),
            urlencoding_minimal(&self.config.cluster_name),
            urlencoding_minimal(&self.config.cloud_account_id),
            urlencoding_minimal(&self.config.region),
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|err| AgentError::Protocol(format!("presign request failed: {err}")))?;

        if !resp.status().is_success() {
            return Err(AgentError::Protocol(format!("presign request returned {}", resp.status())));
        }

        resp.json().await.map_err(|err| AgentError::Protocol(format!("malformed presign response: {err}")))
    }

    async fn put(&self, url: &str, bytes: Vec<u8>) -> PutOutcome {
        match self.client.put(url).body(bytes).send().await {
            Ok(resp) if resp.status().is_success() => PutOutcome::Ok,
            Ok(resp) if resp.status() == StatusCode::FORBIDDEN || resp.status() == StatusCode::NOT_FOUND => PutOutcome::Expired,
            Ok(resp) if matches!(resp.status().as_u16(), 400 | 401 | 403) => PutOutcome::NonRetryable(format!("status {}", resp.status())),
            Ok(resp) if matches!(resp.status().as_u16(), 408 | 425 | 429) || resp.status().is_server_error() => {
                PutOutcome::Retryable(format!("status {}", resp.status()))
            }
            Ok(resp) => PutOutcome::NonRetryable(format!("status {}", resp.status())),
            Err(err) => PutOutcome::Retryable(err.to_string()),
        }
    }

    /// Upload one artifact with retry/backoff and jitter, re-presigning once on URL
    /// expiry. Returns once the artifact reaches a terminal tracker state.
    pub async fn ship_one(&self, meta: &crate::store::ArtifactMeta) -> Result<()> {
        self.tracker.mark_uploading(meta.reference_id)?;

        let mut presigned = self.request_presigned_urls(std::slice::from_ref(meta)).await?;
        let mut put_url = presigned
            .urls
            .iter()
            .find(|u| u.reference_id == meta.reference_id)
            .map(|u| u.put_url.clone())
            .ok_or_else(|| AgentError::Protocol("no presigned url returned for ref".to_string()))?;

        let max_retries = self.config.cloudzero.http_max_retries;
        let max_wait = self.config.cloudzero.http_max_wait;
        let mut total_wait = Duration::ZERO;
        let mut attempt = 0u32;
        let mut consecutive_expired = 0u32;

        loop {
            let data = std::fs::read(&meta.path)?;
            match self.put(&put_url, data).await {
                PutOutcome::Ok => {
                    self.tracker.mark_uploaded(meta.reference_id, chrono::Utc::now())?;
                    self.store.move_to_uploaded(meta.reference_id)?;
                    info!(reference_id = %meta.reference_id, "uploaded artifact");
                    return Ok(());
                }
                PutOutcome::NonRetryable(reason) => {
                    self.tracker.mark_abandoned(meta.reference_id, reason.clone())?;
                    error!(reference_id = %meta.reference_id, reason, "artifact abandoned after non-retryable PUT failure");
                    return Ok(());
                }
                PutOutcome::Expired => {
                    consecutive_expired += 1;
                    if consecutive_expired >= 2 {
                        let reason = "PUT returned 403/404 again after re-presign".to_string();
                        self.tracker.mark_abandoned(meta.reference_id, reason.clone())?;
                        warn!(reference_id = %meta.reference_id, reason, "artifact abandoned after repeated expiry on re-presigned URL");
                        return Ok(());
                    }
                    presigned = self.request_presigned_urls(std::slice::from_ref(meta)).await?;
                    put_url = presigned
                        .urls
                        .iter()
                        .find(|u| u.reference_id == meta.reference_id)
                        .map(|u| u.put_url.clone())
                        .ok_or_else(|| AgentError::Protocol("no presigned url on re-presign".to_string()))?;
                }
                PutOutcome::Retryable(reason) => {
                    consecutive_expired = 0;
                    attempt += 1;
                    if attempt >= max_retries || total_wait >= max_wait {
                        self.tracker.mark_abandoned(meta.reference_id, reason.clone())?;
                        warn!(reference_id = %meta.reference_id, reason, attempt, "artifact abandoned after exhausting retries");
                        return Ok(());
                    }
                    let backoff = backoff_with_jitter(attempt, max_wait - total_wait);
                    total_wait += backoff;
                    self.tracker.mark_retry(meta.reference_id, reason)?;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Server-driven replay (spec §4.4): locate each requested ref in `uploaded/`
    /// first, then `new/`, re-presign, and re-PUT.
    pub async fn handle_replay(&self, refs: &[Uuid]) -> Result<()> {
        for reference_id in refs {
            let located = self
                .store
                .list(crate::store::UPLOADED_DIR)?
                .into_iter()
                .find(|m| m.reference_id == *reference_id)
                .or(self.store.list(crate::store::NEW_DIR)?.into_iter().find(|m| m.reference_id == *reference_id));

            let Some(meta) = located else {
                warn!(%reference_id, "replay requested for unknown artifact");
                continue;
            };

            match self.ship_one(&meta).await {
                Ok(()) => {
                    self.tracker.mark_uploaded(*reference_id, chrono::Utc::now())?;
                }
                Err(err) => warn!(%reference_id, %err, "replay upload failed"),
            }
        }
        Ok(())
    }

    /// Periodic ping announcing liveness and last successful upload time.
    pub fn heartbeat(&self) -> crate::diagnostics::HeartbeatReport {
        crate::diagnostics::HeartbeatReport {
            shipper_id: self.shipper_id.clone(),
            last_successful_upload_at: self.tracker.last_successful_upload_at(),
        }
    }

    /// Run a full discover→presign→upload pass with a bounded worker pool. Ordering
    /// across workers is not guaranteed (spec §4.4, §5).
    pub async fn run_once(self: &Arc<Self>, worker_pool_size: usize) -> Result<()> {
        let pending = self.discover_new()?;
        if pending.is_empty() {
            return Ok(());
        }

        // A batch presign covers both normal uploads and a server-initiated replay
        // list riding along on the same response (spec §4.4, scenario S3).
        let batch = self.request_presigned_urls(&pending).await?;
        if !batch.replay.is_empty() {
            if let Err(err) = self.handle_replay(&batch.replay).await {
                warn!(%err, "batch replay handling failed");
            }
        }

        let mut join_set = tokio::task::JoinSet::new();
        let mut iter = pending.into_iter();
        let mut in_flight = 0usize;

        loop {
            while in_flight < worker_pool_size {
                let Some(meta) = iter.next() else { break };
                let shipper = Arc::clone(self);
                join_set.spawn(async move {
                    if let Err(err) = shipper.ship_one(&meta).await {
                        warn!(reference_id = %meta.reference_id, %err, "ship_one failed");
                    }
                });
                in_flight += 1;
            }
            if join_set.is_empty() {
                break;
            }
            join_set.join_next().await;
            in_flight -= 1;
        }
        Ok(())
    }

    /// Housekeeper (spec §4.4): purge, then expire Uploaded-tracker records older
    /// than `metrics_older_than` (retained slightly longer than the file per
    /// `purge_rules.tracker_grace`, spec §9 open question resolution).
    pub fn run_housekeeper(&self) -> Result<()> {
        let policy = PurgePolicy {
            metrics_older_than: chrono::Duration::from_std(self.config.purge_rules.metrics_older_than).unwrap_or_default(),
            percent: self.config.purge_rules.percent,
        };
        let deleted = self.store.purge(policy, chrono::Utc::now())?;
        if !deleted.is_empty() {
            info!(count = deleted.len(), "housekeeper purged uploaded artifacts");
        }

        let expired = self.tracker.expire_uploaded(
            chrono::Duration::from_std(self.config.purge_rules.metrics_older_than).unwrap_or_default(),
            chrono::Duration::from_std(self.config.purge_rules.tracker_grace).unwrap_or_default(),
            chrono::Utc::now(),
        )?;
        if expired > 0 {
            info!(count = expired, "housekeeper expired tracker records");
        }
        Ok(())
    }
}

fn backoff_with_jitter(attempt: u32, remaining_budget: Duration) -> Duration {
    let base = Duration::from_millis(200u64.saturating_mul(1u64 << attempt.min(10)));
    let capped = base.min(remaining_budget).min(Duration::from_secs(30));
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2 + 1);
    capped + Duration::from_millis(jitter_ms)
}

fn read_api_key(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Minimal query-param escaping for the identity values used to build the presign
/// request URL; these are simple cloud identifiers, not arbitrary user text.
fn urlencoding_minimal(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_remaining_budget_plus_half_jitter() {
        let remaining = Duration::from_secs(5);
        for attempt in 1..8 {
            let b = backoff_with_jitter(attempt, remaining);
            assert!(b <= remaining + remaining / 2 + Duration::from_millis(1));
        }
    }
}
