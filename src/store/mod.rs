//! Artifact Store (spec §4.1): append-buffered writer producing compressed,
//! column-oriented artifacts, directory layout, listing, disk-usage accounting, and
//! purge. Grounded on node-forwarder/src/spool.rs's segment lifecycle (append → seal →
//! atomic rename) generalized from raw append-only segments to per-class, Brotli
//! compressed, CRC-framed artifacts.

pub mod format;

use crate::classify::{Sample, StreamClass};
use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::tracker::Tracker;
use chrono::{DateTime, Utc};
use format::Row;
use std::collections::HashMap;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

pub const NEW_DIR: &str = "new";
pub const UPLOADED_DIR: &str = "uploaded";
pub const REPLAY_DIR: &str = "replay";

#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

pub const SOFT_PRESSURE: f64 = 0.80;
pub const HARD_PRESSURE: f64 = 0.95;

#[derive(Debug, Clone, Copy)]
pub struct PurgePolicy {
    pub metrics_older_than: chrono::Duration,
    pub percent: u8,
}

#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    pub reference_id: Uuid,
    pub class: StreamClass,
    pub closed_at: DateTime<Utc>,
    pub path: PathBuf,
}

struct ActiveBuffer {
    reference_id: Uuid,
    opened_at: DateTime<Utc>,
    rows: Vec<Row>,
}

pub struct Store {
    dir: PathBuf,
    clock: Arc<Clock>,
    compression_level: u8,
    max_records: u64,
    buffers: Mutex<HashMap<StreamClass, ActiveBuffer>>,
    tracker: Arc<Tracker>,
    shipper_id: String,
    dropped_rows: AtomicU64,
    /// In-memory budget beyond which rows are dropped rather than buffered forever
    /// when rotation keeps failing (spec §4.1 failure semantics, default 2x max_records).
    in_memory_budget: u64,
}

pub struct SealedArtifact {
    pub meta: ArtifactMeta,
    pub row_count: usize,
    pub compressed_bytes: u64,
}

impl Store {
    pub fn new(dir: PathBuf, clock: Arc<Clock>, tracker: Arc<Tracker>, shipper_id: String, max_records: u64, compression_level: u8) -> Result<Self> {
        std::fs::create_dir_all(dir.join(NEW_DIR))?;
        std::fs::create_dir_all(dir.join(UPLOADED_DIR))?;
        std::fs::create_dir_all(dir.join(REPLAY_DIR))?;
        Ok(Self {
            dir,
            clock,
            compression_level,
            max_records,
            buffers: Mutex::new(HashMap::new()),
            tracker,
            shipper_id,
            dropped_rows: AtomicU64::new(0),
            in_memory_budget: max_records.saturating_mul(2),
        })
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows.load(Ordering::Relaxed)
    }

    pub fn in_memory_row_count(&self) -> u64 {
        self.buffers.lock().expect("store mutex poisoned").values().map(|b| b.rows.len() as u64).sum()
    }

    /// Append samples to the class's Active buffer, creating one if none exists. Seals
    /// immediately if the buffer reaches `max_records` (spec §8 boundary behavior).
    pub fn put(&self, class: StreamClass, samples: impl IntoIterator<Item = Sample>) -> Result<Option<SealedArtifact>> {
        let should_seal = {
            let mut buffers = self.buffers.lock().expect("store mutex poisoned");
            let incoming: Vec<Sample> = samples.into_iter().collect();

            let buffer = buffers.entry(class).or_insert_with(|| ActiveBuffer {
                reference_id: crate::clock::new_reference_id(),
                opened_at: self.clock.now(),
                rows: Vec::new(),
            });
            for sample in incoming {
                buffer.rows.push(Row {
                    ts_ms: sample.timestamp_ms,
                    metric_name: sample.metric_name,
                    node: sample.node,
                    value: sample.value,
                    labels: sample.labels.into_iter().collect(),
                });
            }
            let seal_due = buffer.rows.len() as u64 >= self.max_records;

            let total_in_memory: u64 = buffers.values().map(|b| b.rows.len() as u64).sum();
            if total_in_memory > self.in_memory_budget {
                let overflow = total_in_memory - self.in_memory_budget;
                // Drop the oldest buffered rows of the class that just grew, bounding
                // memory at `in_memory_budget` (spec §4.1's "degrades by dropping the
                // oldest rows after a bounded in-memory budget").
                let buffer = buffers.get_mut(&class).expect("just inserted above");
                let to_drop = overflow.min(buffer.rows.len() as u64) as usize;
                buffer.rows.drain(0..to_drop);
                self.dropped_rows.fetch_add(to_drop as u64, Ordering::Relaxed);
                warn!(dropped = to_drop, "in-memory row budget exceeded, dropped oldest rows");
            }

            seal_due
        };

        if should_seal {
            self.seal(class)
        } else {
            Ok(None)
        }
    }

    /// Seal `class`'s Active artifact if it has been open at least `max_interval`.
    /// Used by the per-class batcher's timer tick (spec §4.3's "on maxInterval
    /// threshold, the batcher seals the current artifact").
    pub fn seal_if_due(&self, class: StreamClass, max_interval: std::time::Duration) -> Result<Option<SealedArtifact>> {
        let due = {
            let buffers = self.buffers.lock().expect("store mutex poisoned");
            match buffers.get(&class) {
                Some(buffer) => self.clock.now().signed_duration_since(buffer.opened_at) >= chrono::Duration::from_std(max_interval).unwrap_or_default(),
                None => false,
            }
        };
        if due {
            self.seal(class)
        } else {
            Ok(None)
        }
    }

    /// Seal the class's Active artifact if it has buffered rows. A zero-row seal is a
    /// no-op (spec §8: sealing at max_interval with nothing buffered emits no file).
    pub fn seal(&self, class: StreamClass) -> Result<Option<SealedArtifact>> {
        let buffer = {
            let mut buffers = self.buffers.lock().expect("store mutex poisoned");
            buffers.remove(&class)
        };
        let Some(buffer) = buffer else {
            return Ok(None);
        };
        if buffer.rows.is_empty() {
            return Ok(None);
        }

        let closed_at = self.clock.now();
        let encoded = format::encode_artifact(class, &buffer.rows, buffer.reference_id, self.compression_level)?;
        let row_count = buffer.rows.len();

        let filename = format!("{}-{}-{}.art", closed_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true), class.as_str(), buffer.reference_id);
        let new_dir = self.dir.join(NEW_DIR);
        let tmp_path = new_dir.join(format!(".tmp-{}", buffer.reference_id));
        let final_path = new_dir.join(&filename);

        {
            let mut f = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            f.write_all(&encoded.bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        if let Ok(dir_handle) = std::fs::File::open(&new_dir) {
            let _ = dir_handle.sync_all();
        }

        let key = crate::path::build_key(&crate::path::KeyParams {
            organization_id: "",
            cloud_account_id: "",
            cluster_name: "",
            shipper_id: &self.shipper_id,
            region: "",
            reference_id: buffer.reference_id,
            closed_at,
        });
        self.tracker.create_sealed(buffer.reference_id, key, self.shipper_id.clone(), closed_at)?;

        info!(reference_id = %buffer.reference_id, class = class.as_str(), row_count, "sealed artifact");

        Ok(Some(SealedArtifact {
            meta: ArtifactMeta {
                reference_id: buffer.reference_id,
                class,
                closed_at,
                path: final_path,
            },
            row_count,
            compressed_bytes: encoded.bytes.len() as u64,
        }))
    }

    /// Seal every Active artifact regardless of size/time thresholds (shutdown, or
    /// shipper-initiated rotation).
    pub fn flush(&self) -> Result<Vec<SealedArtifact>> {
        let classes: Vec<StreamClass> = self.buffers.lock().expect("store mutex poisoned").keys().copied().collect();
        let mut sealed = Vec::new();
        for class in classes {
            if let Some(artifact) = self.seal(class)? {
                sealed.push(artifact);
            }
        }
        Ok(sealed)
    }

    /// Enumerate Sealed/Uploaded artifacts under `subdir`, sorted by closedAt
    /// ascending. Filenames embed an RFC3339-nanos timestamp first, so lexicographic
    /// and chronological order coincide.
    pub fn list(&self, subdir: &str) -> Result<Vec<ArtifactMeta>> {
        let dir = self.dir.join(subdir);
        let mut entries = Vec::new();
        if !dir.exists() {
            return Ok(entries);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".art") {
                continue;
            }
            if let Some(meta) = parse_filename(&name, entry.path()) {
                entries.push(meta);
            }
        }
        entries.sort_by_key(|m| m.closed_at);
        Ok(entries)
    }

    /// Return the subset of `file_basenames` that exist in `subdir`, matched purely by
    /// basename so a caller-supplied path prefix can never be used to probe outside it.
    pub fn get_matching(&self, subdir: &str, file_basenames: &[String]) -> Result<Vec<String>> {
        let dir = self.dir.join(subdir);
        let mut found = Vec::new();
        for basename in file_basenames {
            let base = Path::new(basename).file_name().map(|n| n.to_os_string()).unwrap_or_else(|| basename.as_str().into());
            if dir.join(&base).exists() {
                found.push(base.to_string_lossy().to_string());
            }
        }
        Ok(found)
    }

    fn locate(&self, reference_id: Uuid) -> Result<Option<PathBuf>> {
        for subdir in [NEW_DIR, UPLOADED_DIR, REPLAY_DIR] {
            for artifact in self.list(subdir)? {
                if artifact.reference_id == reference_id {
                    return Ok(Some(artifact.path));
                }
            }
        }
        Ok(None)
    }

    /// Stream-decode a sealed artifact's rows. Restartable: callers re-invoke this
    /// rather than holding a cursor, since artifacts are immutable once sealed.
    pub fn open(&self, reference_id: Uuid) -> Result<format::DecodedArtifact> {
        let path = self
            .locate(reference_id)?
            .ok_or_else(|| AgentError::Protocol(format!("no artifact found for {reference_id}")))?;
        let data = std::fs::read(&path)?;
        format::decode_artifact(&data)
    }

    pub fn move_to_uploaded(&self, reference_id: Uuid) -> Result<()> {
        self.move_artifact(reference_id, NEW_DIR, UPLOADED_DIR)
    }

    pub fn move_to_replay(&self, reference_id: Uuid) -> Result<()> {
        self.move_artifact(reference_id, UPLOADED_DIR, REPLAY_DIR)
    }

    fn move_artifact(&self, reference_id: Uuid, from: &str, to: &str) -> Result<()> {
        let source = self
            .list(from)?
            .into_iter()
            .find(|m| m.reference_id == reference_id)
            .ok_or_else(|| AgentError::Protocol(format!("artifact {reference_id} not found in {from}")))?;
        let filename = source.path.file_name().expect("artifact path always has a filename");
        let dest = self.dir.join(to).join(filename);
        std::fs::rename(&source.path, &dest)?;
        Ok(())
    }

    pub fn usage(&self) -> Result<DiskUsage> {
        statvfs_usage(&self.dir)
    }

    /// Delete Uploaded artifacts older than `metrics_older_than`; under hard disk
    /// pressure, forcibly delete the oldest `percent%` regardless of age. Never
    /// touches `new/` or `replay/`. Idempotent: a second call with no new uploads finds
    /// nothing left to do.
    pub fn purge(&self, policy: PurgePolicy, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut uploaded = self.list(UPLOADED_DIR)?;
        let usage = self.usage()?;
        let mut deleted = Vec::new();

        if usage.used_fraction() >= HARD_PRESSURE {
            let n = ((uploaded.len() as f64) * (policy.percent as f64 / 100.0)).ceil() as usize;
            let n = n.min(uploaded.len());
            for artifact in uploaded.drain(..n) {
                std::fs::remove_file(&artifact.path)?;
                deleted.push(artifact.reference_id);
            }
            return Ok(deleted);
        }

        let cutoff = now - policy.metrics_older_than;
        for artifact in uploaded {
            if artifact.closed_at < cutoff {
                std::fs::remove_file(&artifact.path)?;
                deleted.push(artifact.reference_id);
            }
        }
        Ok(deleted)
    }

    /// Reference ids (with key + createdAt) for every sealed file in `new/`, for
    /// startup tracker reconciliation.
    pub fn new_refs(&self) -> Result<Vec<(Uuid, String, DateTime<Utc>)>> {
        self.list(NEW_DIR)?
            .into_iter()
            .map(|m| {
                let key = crate::path::build_key(&crate::path::KeyParams {
                    organization_id: "",
                    cloud_account_id: "",
                    cluster_name: "",
                    shipper_id: &self.shipper_id,
                    region: "",
                    reference_id: m.reference_id,
                    closed_at: m.closed_at,
                });
                Ok((m.reference_id, key, m.closed_at))
            })
            .collect()
    }

    /// After a crash between rename and tracker-create, rebuild missing tracker
    /// entries by scanning `new/` filenames (spec §4.1 edge case).
    pub fn reconcile_tracker(&self) -> Result<()> {
        let refs = self.new_refs()?;
        self.tracker.reconcile(&refs, &self.shipper_id)
    }

    /// Remove any leftover `.tmp-*` files in `new/` (spec §8: after shutdown drain,
    /// `new/` contains no temp files). Safe to call at startup since a `.tmp-*` only
    /// exists mid-rotation and is never the commit point.
    pub fn clean_tmp_files(&self) -> Result<()> {
        let new_dir = self.dir.join(NEW_DIR);
        if !new_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&new_dir)? {
            let entry = entry?;
            if entry.file_name().as_bytes().starts_with(b".tmp-") {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Filenames are `{closedAt}-{class}-{referenceId}.art`. The referenceId is a
/// hyphenated UUID (fixed 36 chars), so it is peeled off by length rather than by
/// splitting on `-`, which the UUID itself contains.
fn parse_filename(name: &str, path: PathBuf) -> Option<ArtifactMeta> {
    const UUID_LEN: usize = 36;
    let stem = name.strip_suffix(".art")?;
    if stem.len() < UUID_LEN + 2 {
        return None;
    }
    let split = stem.len() - UUID_LEN;
    let reference_id = &stem[split..];
    let rest = stem[..split].strip_suffix('-')?;

    let reference_id = Uuid::parse_str(reference_id).ok()?;
    let (closed_at, class) = rest.rsplit_once('-')?;
    let class = match class {
        "cost" => StreamClass::Cost,
        "observability" => StreamClass::Observability,
        _ => return None,
    };
    let closed_at = DateTime::parse_from_rfc3339(closed_at).ok()?.with_timezone(&Utc);

    Some(ArtifactMeta {
        reference_id,
        class,
        closed_at,
        path,
    })
}

/// Disk accounting via `statvfs(2)`, the same direct-libc idiom
/// node-forwarder/src/spool.rs::statvfs_bytes uses for spool budget calculations.
/// `statvfs` field widths vary across libc targets, so the `as u64` casts below stay
/// explicit even where this target's fields are already `u64`.
#[allow(clippy::unnecessary_cast)]
fn statvfs_usage(dir: &Path) -> Result<DiskUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(dir.as_os_str().as_bytes()).map_err(|err| AgentError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(AgentError::Io(std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    let total_bytes = stat.f_blocks as u64 * block_size;
    let free_bytes = stat.f_bfree as u64 * block_size;
    let available_bytes = stat.f_bavail as u64 * block_size;
    let used_bytes = total_bytes.saturating_sub(free_bytes);

    Ok(DiskUsage {
        total_bytes,
        used_bytes,
        free_bytes,
        available_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Sample;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_store(max_records: u64) -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(Tracker::open(&dir.path().join("tracker.db")).unwrap());
        let store = Store::new(dir.path().join("data"), Arc::new(Clock::new()), tracker, "shipper-1".to_string(), max_records, 5).unwrap();
        (dir, store)
    }

    fn sample(name: &str, ts: i64) -> Sample {
        Sample {
            cluster: "c".to_string(),
            cloud_account: "a".to_string(),
            metric_name: name.to_string(),
            node: "n".to_string(),
            timestamp_ms: ts,
            labels: BTreeMap::new(),
            value: "1".to_string(),
        }
    }

    #[test]
    fn seals_immediately_at_max_records() {
        let (_dir, store) = test_store(3);
        assert!(store.put(StreamClass::Cost, vec![sample("m", 1), sample("m", 2)]).unwrap().is_none());
        let sealed = store.put(StreamClass::Cost, vec![sample("m", 3)]).unwrap();
        assert!(sealed.is_some());
        assert_eq!(sealed.unwrap().row_count, 3);
    }

    #[test]
    fn in_memory_budget_truncates_oldest_rows_and_counts_them() {
        // max_records=10 => in_memory_budget=20.
        let (_dir, store) = test_store(10);
        let obs_rows: Vec<Sample> = (0..9).map(|i| sample("m", i)).collect();
        assert!(store.put(StreamClass::Observability, obs_rows).unwrap().is_none());

        // 50 rows in one call both crosses max_records (seals) and blows the 20-row
        // in-memory budget by 39 once combined with the 9 Observability rows already
        // buffered; the oldest 39 Cost rows must be dropped before sealing, not kept.
        let cost_rows: Vec<Sample> = (0..50).map(|i| sample("m", i)).collect();
        let sealed = store.put(StreamClass::Cost, cost_rows).unwrap().expect("seals at max_records");

        assert_eq!(sealed.row_count, 11, "only the un-dropped tail of the Cost buffer should be sealed");
        assert_eq!(store.dropped_rows(), 39, "the budget overflow must be reflected in the drop counter");
        assert_eq!(store.in_memory_row_count(), 9, "only the untouched Observability buffer remains in memory");
    }

    #[test]
    fn sealing_empty_buffer_emits_nothing() {
        let (_dir, store) = test_store(100);
        assert!(store.seal(StreamClass::Cost).unwrap().is_none());
        assert!(store.list(NEW_DIR).unwrap().is_empty());
    }

    #[test]
    fn list_is_sorted_by_closed_at() {
        let (_dir, store) = test_store(1);
        store.put(StreamClass::Cost, vec![sample("m", 1)]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put(StreamClass::Observability, vec![sample("m", 2)]).unwrap();
        let listed = store.list(NEW_DIR).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].closed_at <= listed[1].closed_at);
    }

    #[test]
    fn get_matching_ignores_path_prefix() {
        let (_dir, store) = test_store(1);
        let sealed = store.put(StreamClass::Cost, vec![sample("m", 1)]).unwrap().unwrap();
        let basename = sealed.meta.path.file_name().unwrap().to_string_lossy().to_string();
        let with_prefix = format!("/whatever/prefix/{basename}");
        let found = store.get_matching(NEW_DIR, &[with_prefix]).unwrap();
        assert_eq!(found, vec![basename]);
    }

    #[test]
    fn move_to_uploaded_then_open_still_works() {
        let (_dir, store) = test_store(1);
        let sealed = store.put(StreamClass::Cost, vec![sample("m", 1)]).unwrap().unwrap();
        store.move_to_uploaded(sealed.meta.reference_id).unwrap();
        let decoded = store.open(sealed.meta.reference_id).unwrap();
        assert_eq!(decoded.rows.len(), 1);
        assert!(store.list(UPLOADED_DIR).unwrap().iter().any(|m| m.reference_id == sealed.meta.reference_id));
    }

    #[test]
    fn purge_deletes_old_uploaded_only() {
        let (_dir, store) = test_store(1);
        let sealed = store.put(StreamClass::Cost, vec![sample("m", 1)]).unwrap().unwrap();
        store.move_to_uploaded(sealed.meta.reference_id).unwrap();

        let still_new = store.put(StreamClass::Cost, vec![sample("m", 2)]).unwrap().unwrap();

        let policy = PurgePolicy {
            metrics_older_than: chrono::Duration::seconds(0),
            percent: 100,
        };
        let future = Utc::now() + chrono::Duration::days(1);
        let deleted = store.purge(policy, future).unwrap();
        assert_eq!(deleted, vec![sealed.meta.reference_id]);
        assert!(store.list(NEW_DIR).unwrap().iter().any(|m| m.reference_id == still_new.meta.reference_id));
    }

    #[test]
    fn purge_is_idempotent() {
        let (_dir, store) = test_store(1);
        let sealed = store.put(StreamClass::Cost, vec![sample("m", 1)]).unwrap().unwrap();
        store.move_to_uploaded(sealed.meta.reference_id).unwrap();

        let policy = PurgePolicy {
            metrics_older_than: chrono::Duration::seconds(0),
            percent: 100,
        };
        let future = Utc::now() + chrono::Duration::days(1);
        store.purge(policy, future).unwrap();
        let second = store.purge(policy, future).unwrap();
        assert!(second.is_empty());
    }
}
