//! Cloud provider scout (spec §2, §9 collaborator stub): detects cloud account,
//! region, and cluster name at config load by probing each provider's instance
//! metadata service. A tagged variant with a uniform detect capability, run
//! concurrently; the first non-`Unknown` wins and the rest are dropped (spec §9
//! design note on dynamic dispatch for cloud providers).
//!
//! Detection-only: no credential exchange, no provider SDKs (spec §1 Non-goals keep
//! the upload path server-driven, not cloud-API-driven).

use reqwest::Client;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentInfo {
    pub provider: Option<Provider>,
    pub cloud_account_id: String,
    pub region: String,
    pub cluster_name: String,
}

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Run all provider probes concurrently and return the first successful one.
/// `Unknown` if none of them respond in time.
pub async fn detect() -> EnvironmentInfo {
    let client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return EnvironmentInfo::default(),
    };

    let (aws, azure, gcp) = tokio::join!(detect_aws(&client), detect_azure(&client), detect_gcp(&client));

    [aws, azure, gcp].into_iter().flatten().next().unwrap_or(EnvironmentInfo {
        provider: Some(Provider::Unknown),
        ..Default::default()
    })
}

async fn detect_aws(client: &Client) -> Option<EnvironmentInfo> {
    let resp = client
        .get("http://169.254.169.254/latest/dynamic/instance-identity/document")
        .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    debug!("detected AWS environment");
    Some(EnvironmentInfo {
        provider: Some(Provider::Aws),
        cloud_account_id: body.get("accountId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        region: body.get("region").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        cluster_name: String::new(),
    })
}

async fn detect_azure(client: &Client) -> Option<EnvironmentInfo> {
    let resp = client
        .get("http://169.254.169.254/metadata/instance?api-version=2021-02-01")
        .header("Metadata", "true")
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    debug!("detected Azure environment");
    let compute = body.get("compute")?;
    Some(EnvironmentInfo {
        provider: Some(Provider::Azure),
        cloud_account_id: compute.get("subscriptionId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        region: compute.get("location").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        cluster_name: String::new(),
    })
}

async fn detect_gcp(client: &Client) -> Option<EnvironmentInfo> {
    let resp = client
        .get("http://metadata.google.internal/computeMetadata/v1/project/project-id")
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let project_id = resp.text().await.ok()?;
    debug!("detected GCP environment");
    Some(EnvironmentInfo {
        provider: Some(Provider::Gcp),
        cloud_account_id: project_id,
        region: String::new(),
        cluster_name: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_returns_unknown_when_no_metadata_service_reachable() {
        let info = detect().await;
        assert_eq!(info.provider, Some(Provider::Unknown));
    }
}
