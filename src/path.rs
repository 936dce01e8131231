//! Object-store key builder (spec §4.5). Pure and deterministic: same inputs always
//! produce the same byte-identical key, matching the server's expected layout.

use chrono::{DateTime, Datelike, Timelike, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use uuid::Uuid;

/// Encode a path segment the way the server expects: everything but unreserved
/// characters is percent-encoded, including `/` so a segment can never smuggle in an
/// extra path component.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b' ')
    .add(b'=')
    .add(b'&');

#[derive(Debug, Clone)]
pub struct KeyParams<'a> {
    pub organization_id: &'a str,
    pub cloud_account_id: &'a str,
    pub cluster_name: &'a str,
    pub shipper_id: &'a str,
    pub region: &'a str,
    pub reference_id: Uuid,
    pub closed_at: DateTime<Utc>,
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Build the remote object key for an artifact. Byte-identical for identical inputs.
pub fn build_key(params: &KeyParams<'_>) -> String {
    format!(
        "upload/organization_id={org}/year={y:04}/month={m:02}/day={d:02}/hour={h:02}/cloud_account_id={acct}/cluster_name={cluster}/shipper_id={shipper}/region={region}/{rid}.parquet",
        org = encode(params.organization_id),
        y = params.closed_at.year(),
        m = params.closed_at.month(),
        d = params.closed_at.day(),
        h = params.closed_at.hour(),
        acct = encode(params.cloud_account_id),
        cluster = encode(params.cluster_name),
        shipper = encode(params.shipper_id),
        region = encode(params.region),
        rid = params.reference_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_params(reference_id: Uuid, closed_at: DateTime<Utc>) -> KeyParams<'static> {
        KeyParams {
            organization_id: "org one",
            cloud_account_id: "acct/1",
            cluster_name: "prod-cluster",
            shipper_id: "shipper-a",
            region: "us-east-1",
            reference_id,
            closed_at,
        }
    }

    #[test]
    fn is_pure_and_deterministic() {
        let rid = Uuid::new_v4();
        let closed_at = Utc.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        let params = sample_params(rid, closed_at);
        assert_eq!(build_key(&params), build_key(&params));
    }

    #[test]
    fn percent_encodes_unsafe_segments() {
        let rid = Uuid::new_v4();
        let closed_at = Utc.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        let key = build_key(&sample_params(rid, closed_at));
        assert!(key.contains("organization_id=org%20one"));
        assert!(key.contains("cloud_account_id=acct%2F1"));
        assert!(!key.contains("org one"));
    }

    #[test]
    fn year_month_day_hour_are_zero_padded_and_from_closed_at() {
        let rid = Uuid::new_v4();
        let closed_at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 0, 0).unwrap();
        let key = build_key(&sample_params(rid, closed_at));
        assert!(key.contains("/year=2026/month=01/day=02/hour=03/"));
    }
}
