//! Registration store adapter.
//!
//! Only the find-or-create contract matters to the protocol layer:
//! `Created` when no record existed for the hardware id (and one was
//! written), `Existing` otherwise. The filesystem store keeps one JSON
//! file per hardware id and relies on `O_EXCL` creation, so the
//! conditional insert is atomic even when two workers race the same
//! first registration; the read-then-write pattern is deliberately
//! avoided.

use crate::{ServerError, ServerResult};
use async_trait::async_trait;
use dashmap::DashMap;
use pulse_types::{RegistrationOutcome, RegistrationRecord};
use std::path::PathBuf;
use tracing::debug;

/// Find-or-create contract for registration records.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Create a record for `hardware_id` unless one exists.
    async fn find_or_create(
        &self,
        hardware_id: &str,
        record: &RegistrationRecord,
    ) -> ServerResult<RegistrationOutcome>;
}

/// Filesystem-backed store: one JSON file per hardware id.
pub struct FsRegistrationStore {
    dir: PathBuf,
}

impl FsRegistrationStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, hardware_id: &str) -> PathBuf {
        // Hardware ids are MAC addresses or host names; keep the file
        // name readable but shell- and path-safe.
        let safe: String = hardware_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl RegistrationStore for FsRegistrationStore {
    async fn find_or_create(
        &self,
        hardware_id: &str,
        record: &RegistrationRecord,
    ) -> ServerResult<RegistrationOutcome> {
        let path = self.record_path(hardware_id);
        let dir = self.dir.clone();
        let record = record.clone();
        let hardware_id = hardware_id.to_string();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;

            // O_EXCL create is the atomic conditional insert: exactly
            // one of two racing workers sees Created.
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    serde_json::to_writer_pretty(file, &record)
                        .map_err(|e| ServerError::Store(format!("write failed: {}", e)))?;
                    debug!(hardware_id = %hardware_id, "Registration record created");
                    Ok(RegistrationOutcome::Created)
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(hardware_id = %hardware_id, "Registration record already present");
                    Ok(RegistrationOutcome::Existing)
                }
                Err(e) => Err(ServerError::Io(e)),
            }
        })
        .await
        .map_err(|e| ServerError::Store(format!("store task failed: {}", e)))?
    }
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryRegistrationStore {
    records: DashMap<String, RegistrationRecord>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn find_or_create(
        &self,
        hardware_id: &str,
        record: &RegistrationRecord,
    ) -> ServerResult<RegistrationOutcome> {
        match self.records.entry(hardware_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(RegistrationOutcome::Existing),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(RegistrationOutcome::Created)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn record(id: &str) -> RegistrationRecord {
        RegistrationRecord {
            hardware_id: id.to_string(),
            os_type: "Linux".to_string(),
            core_count: 4,
            core_model: "Test CPU".to_string(),
            core_speed_mhz: 2000,
            total_memory_bytes: 1 << 30,
            registered_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_fs_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRegistrationStore::new(dir.path().to_path_buf());
        let rec = record("AA:BB:CC:DD:EE:FF");

        let first = store.find_or_create("AA:BB:CC:DD:EE:FF", &rec).await.unwrap();
        let second = store.find_or_create("AA:BB:CC:DD:EE:FF", &rec).await.unwrap();

        assert_eq!(first, RegistrationOutcome::Created);
        assert_eq!(second, RegistrationOutcome::Existing);

        // Exactly one record file on disk.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_concurrent_racers_get_one_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsRegistrationStore::new(dir.path().to_path_buf()));
        let rec = record("11:22:33:44:55:66");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let rec = rec.clone();
            handles.push(tokio::spawn(async move {
                store.find_or_create("11:22:33:44:55:66", &rec).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() == RegistrationOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1, "exactly one racer may observe Created");
    }

    #[tokio::test]
    async fn test_memory_store_is_idempotent() {
        let store = MemoryRegistrationStore::new();
        let rec = record("aa");

        assert_eq!(
            store.find_or_create("aa", &rec).await.unwrap(),
            RegistrationOutcome::Created
        );
        assert_eq!(
            store.find_or_create("aa", &rec).await.unwrap(),
            RegistrationOutcome::Existing
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_record_paths_stay_inside_store_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRegistrationStore::new(dir.path().to_path_buf());
        let rec = record("../../etc/passwd");

        store.find_or_create("../../etc/passwd", &rec).await.unwrap();
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("_"));
    }
}
