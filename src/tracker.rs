//! Upload tracker (spec §3, §4.4): a persisted key-value store of `UploadRecord`,
//! single-writer (Shipper) / single-reader (Housekeeper, diagnostics). Persisted as a
//! JSON document with atomic tmp-file + rename, the way node-forwarder persists its
//! spool state (`persist_state`/`load_or_init_state` in spool.rs) rather than pulling in
//! a database dependency for a small append-mostly map.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Sealed,
    Uploading,
    Uploaded,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub reference_id: Uuid,
    pub key: String,
    pub shipper_id: String,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerDoc {
    records: BTreeMap<Uuid, UploadRecord>,
}

pub struct Tracker {
    path: PathBuf,
    doc: Mutex<TrackerDoc>,
}

impl Tracker {
    pub fn open(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data).unwrap_or_default()
        } else {
            TrackerDoc::default()
        };
        let tracker = Self {
            path: path.to_path_buf(),
            doc: Mutex::new(doc),
        };
        tracker.persist()?;
        Ok(tracker)
    }

    fn persist(&self) -> Result<()> {
        let doc = self.doc.lock().expect("tracker mutex poisoned");
        let data = serde_json::to_vec_pretty(&*doc).map_err(|err| crate::error::AgentError::Encode(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Idempotent: a repeated create for the same referenceId is a no-op (spec §8).
    pub fn create_sealed(&self, reference_id: Uuid, key: String, shipper_id: String, created_at: DateTime<Utc>) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            if doc.records.contains_key(&reference_id) {
                return Ok(());
            }
            doc.records.insert(
                reference_id,
                UploadRecord {
                    reference_id,
                    key,
                    shipper_id,
                    state: UploadState::Sealed,
                    created_at,
                    uploaded_at: None,
                    attempts: 0,
                    last_error: None,
                },
            );
        }
        self.persist()
    }

    pub fn mark_uploading(&self, reference_id: Uuid) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            if let Some(rec) = doc.records.get_mut(&reference_id) {
                rec.state = UploadState::Uploading;
                rec.attempts += 1;
            }
        }
        self.persist()
    }

    pub fn mark_uploaded(&self, reference_id: Uuid, uploaded_at: DateTime<Utc>) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            if let Some(rec) = doc.records.get_mut(&reference_id) {
                rec.state = UploadState::Uploaded;
                rec.uploaded_at = Some(uploaded_at);
            }
        }
        self.persist()
    }

    pub fn mark_retry(&self, reference_id: Uuid, error: String) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            if let Some(rec) = doc.records.get_mut(&reference_id) {
                rec.state = UploadState::Sealed;
                rec.last_error = Some(error);
            }
        }
        self.persist()
    }

    pub fn mark_abandoned(&self, reference_id: Uuid, error: String) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            if let Some(rec) = doc.records.get_mut(&reference_id) {
                rec.state = UploadState::Abandoned;
                rec.last_error = Some(error);
            }
        }
        self.persist()
    }

    pub fn get(&self, reference_id: Uuid) -> Option<UploadRecord> {
        self.doc.lock().expect("tracker mutex poisoned").records.get(&reference_id).cloned()
    }

    pub fn last_successful_upload_at(&self) -> Option<DateTime<Utc>> {
        self.doc
            .lock()
            .expect("tracker mutex poisoned")
            .records
            .values()
            .filter_map(|r| r.uploaded_at)
            .max()
    }

    /// Remove a record outright (used when reconciliation finds no backing file).
    pub fn remove(&self, reference_id: Uuid) -> Result<()> {
        {
            let mut doc = self.doc.lock().expect("tracker mutex poisoned");
            doc.records.remove(&reference_id);
        }
        self.persist()
    }

    pub fn all(&self) -> Vec<UploadRecord> {
        self.doc.lock().expect("tracker mutex poisoned").records.values().cloned().collect()
    }

    /// Startup reconciliation (spec §4.4): any `Uploading` record resets to `Sealed`
    /// (a crash mid-upload); any record without a backing file is dropped; any file
    /// without a record gets one created. `new_refs` is the set of referenceIds found
    /// on disk in `new/` with their keys and creation times.
    pub fn reconcile(&self, new_refs: &[(Uuid, String, DateTime<Utc>)], shipper_id: &str) -> Result<()> {
        let present: std::collections::HashSet<Uuid> = new_refs.iter().map(|(id, _, _)| *id).collect();

        let stale_uploading: Vec<Uuid> = {
            let doc = self.doc.lock().expect("tracker mutex poisoned");
            doc.records
                .values()
                .filter(|r| r.state == UploadState::Uploading)
                .map(|r| r.reference_id)
                .collect()
        };
        for id in stale_uploading {
            self.mark_retry(id, "reset on startup reconciliation".to_string())?;
        }

        let orphaned: Vec<Uuid> = {
            let doc = self.doc.lock().expect("tracker mutex poisoned");
            doc.records
                .values()
                .filter(|r| matches!(r.state, UploadState::Sealed | UploadState::Uploading) && !present.contains(&r.reference_id))
                .map(|r| r.reference_id)
                .collect()
        };
        for id in orphaned {
            self.remove(id)?;
        }

        for (id, key, created_at) in new_refs {
            self.create_sealed(*id, key.clone(), shipper_id.to_string(), *created_at)?;
        }

        Ok(())
    }

    /// Expire Uploaded records older than `older_than + grace` (spec §4.4 housekeeper,
    /// tracker outlives the file so late server replay still sees "uploaded").
    pub fn expire_uploaded(&self, older_than: chrono::Duration, grace: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - older_than - grace;
        let expired: Vec<Uuid> = {
            let doc = self.doc.lock().expect("tracker mutex poisoned");
            doc.records
                .values()
                .filter(|r| r.state == UploadState::Uploaded && r.uploaded_at.map(|t| t < cutoff).unwrap_or(false))
                .map(|r| r.reference_id)
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.remove(id)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sealed_is_idempotent() {
        let dir = tempdir().unwrap();
        let tracker = Tracker::open(&dir.path().join("tracker.db")).unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        tracker.create_sealed(id, "k".to_string(), "s1".to_string(), now).unwrap();
        tracker.create_sealed(id, "k".to_string(), "s1".to_string(), now).unwrap();
        assert_eq!(tracker.all().len(), 1);
    }

    #[test]
    fn reconcile_resets_uploading_and_drops_orphans() {
        let dir = tempdir().unwrap();
        let tracker = Tracker::open(&dir.path().join("tracker.db")).unwrap();
        let crashed = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        let now = Utc::now();
        tracker.create_sealed(crashed, "k1".to_string(), "s1".to_string(), now).unwrap();
        tracker.mark_uploading(crashed).unwrap();
        tracker.create_sealed(orphan, "k2".to_string(), "s1".to_string(), now).unwrap();

        tracker.reconcile(&[(crashed, "k1".to_string(), now)], "s1").unwrap();

        let rec = tracker.get(crashed).unwrap();
        assert_eq!(rec.state, UploadState::Sealed);
        assert!(tracker.get(orphan).is_none());
    }

    #[test]
    fn reconcile_creates_record_for_untracked_file() {
        let dir = tempdir().unwrap();
        let tracker = Tracker::open(&dir.path().join("tracker.db")).unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        tracker.reconcile(&[(id, "k".to_string(), now)], "s1").unwrap();
        assert!(tracker.get(id).is_some());
    }

    #[test]
    fn survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        let id = Uuid::new_v4();
        {
            let tracker = Tracker::open(&path).unwrap();
            tracker.create_sealed(id, "k".to_string(), "s1".to_string(), Utc::now()).unwrap();
        }
        let reopened = Tracker::open(&path).unwrap();
        assert!(reopened.get(id).is_some());
    }
}
