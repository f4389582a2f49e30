//! The persistence contract (SPEC_FULL.md §6.2) plus two in-process
//! implementations: [`MemoryStore`] (the default) and [`FileJournalStore`]
//! (durability across restarts via an append-only JSON-lines telemetry log
//! and a snapshot file for device/customer rows).
//!
//! The core never holds a per-IMEI lock across a store call — the reducer
//! reads, mutates, and writes the device row without exclusive access, so
//! concurrent writers racing on the same IMEI are resolved last-writer-wins
//! (SPEC_FULL.md §6.2). Implementations MUST NOT block the calling task for
//! long periods; both implementations here are non-blocking by construction
//! (an in-memory `RwLock` and buffered async file I/O respectively) so no
//! `spawn_blocking` offload is needed. A caller supplying a genuinely
//! blocking store (e.g. a synchronous database driver) must offload it
//! itself to preserve the concurrency model in SPEC_FULL.md §5.

use crate::model::{Customer, Device, PartialDeviceUpdate, TelemetrySample};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The contract the core depends on. Never the document store, the push
/// gateway, or an HTTP admin console directly — those live behind this
/// trait so they can be swapped without touching the core (SPEC_FULL.md
/// §1).
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a telemetry sample. Never fails fatally to the caller: a
    /// store outage drops the sample and the connection handler continues
    /// (availability over durability for this path, SPEC_FULL.md §6.2).
    async fn append_telemetry(&self, sample: TelemetrySample);

    async fn load_device(&self, imei: &str) -> Option<Device>;

    /// Atomic field-level set. Lazily creates the row if it doesn't exist
    /// yet (SPEC_FULL.md §7: "missing device row: lazily create via
    /// upsert; not an error").
    async fn upsert_device(&self, imei: &str, update: PartialDeviceUpdate);

    async fn load_customer(&self, id: &str) -> Option<Customer>;

    /// Admin surface (SPEC_FULL.md §3.5): request a block (`true`) or
    /// unblock (`false`).
    async fn request_block(&self, imei: &str, block: bool) {
        self.upsert_device(
            imei,
            PartialDeviceUpdate {
                block_cmd_pending: Some(Some(block)),
                ..Default::default()
            },
        )
        .await;
    }

    /// Admin surface (SPEC_FULL.md §3.5): request a `GTSRI` migration.
    async fn request_ip_change(&self, imei: &str) {
        self.upsert_device(
            imei,
            PartialDeviceUpdate {
                ip_change_pending: Some(true),
                ..Default::default()
            },
        )
        .await;
    }
}

/// Process-lifetime-only store. The default backend (`persistence_uri =
/// "memory://"`).
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, Device>>,
    customers: RwLock<HashMap<String, Customer>>,
    telemetry: RwLock<Vec<TelemetrySample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a customer row; used by admin tooling / tests, not by the core.
    pub async fn put_customer(&self, customer: Customer) {
        self.customers
            .write()
            .await
            .insert(customer.id.clone(), customer);
    }

    /// Snapshot of every telemetry sample recorded so far; used by tests.
    pub async fn telemetry_for(&self, imei: &str) -> Vec<TelemetrySample> {
        self.telemetry
            .read()
            .await
            .iter()
            .filter(|s| s.imei == imei)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_telemetry(&self, sample: TelemetrySample) {
        self.telemetry.write().await.push(sample);
    }

    async fn load_device(&self, imei: &str) -> Option<Device> {
        self.devices.read().await.get(imei).cloned()
    }

    async fn upsert_device(&self, imei: &str, update: PartialDeviceUpdate) {
        let mut devices = self.devices.write().await;
        let row = devices
            .entry(imei.to_string())
            .or_insert_with(|| Device::new(imei));
        row.apply(&update);
    }

    async fn load_customer(&self, id: &str) -> Option<Customer> {
        self.customers.read().await.get(id).cloned()
    }
}

/// A [`MemoryStore`] with durability: telemetry is additionally appended to
/// a JSON-lines file and the device/customer table is snapshotted to a JSON
/// file after every mutation, so a restart can replay state. Grounded on the
/// original `database.py`'s dual nature — MongoDB in production, a simpler
/// in-process stand-in exercised directly by the original test scripts.
pub struct FileJournalStore {
    inner: MemoryStore,
    telemetry_log: Mutex<tokio::fs::File>,
    snapshot_path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct Snapshot {
    devices: HashMap<String, Device>,
    customers: HashMap<String, Customer>,
}

impl FileJournalStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let telemetry_path = dir.join("telemetry.jsonl");
        let snapshot_path = dir.join("devices.json");

        let inner = MemoryStore::new();
        if let Ok(bytes) = tokio::fs::read(&snapshot_path).await {
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            *inner.devices.write().await = snapshot.devices;
            *inner.customers.write().await = snapshot.customers;
        }

        let telemetry_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&telemetry_path)
            .await?;

        Ok(FileJournalStore {
            inner,
            telemetry_log: Mutex::new(telemetry_log),
            snapshot_path,
        })
    }

    async fn write_snapshot(&self) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            devices: self.inner.devices.read().await.clone(),
            customers: self.inner.customers.read().await.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(&self.snapshot_path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileJournalStore {
    async fn append_telemetry(&self, sample: TelemetrySample) {
        if let Ok(line) = serde_json::to_string(&sample) {
            let mut file = self.telemetry_log.lock().await;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        self.inner.append_telemetry(sample).await;
    }

    async fn load_device(&self, imei: &str) -> Option<Device> {
        self.inner.load_device(imei).await
    }

    async fn upsert_device(&self, imei: &str, update: PartialDeviceUpdate) {
        self.inner.upsert_device(imei, update).await;
        let _ = self.write_snapshot().await;
    }

    async fn load_customer(&self, id: &str) -> Option<Customer> {
        self.inner.load_customer(id).await
    }
}

/// Construct the configured store backend from a `persistence_uri` value:
/// `memory://` (default) or `file://<path>`. `db` is the configured
/// `persistence_db` namespace (SPEC_FULL.md §6.1) — for the file backend it
/// is a subdirectory under `path`, so two services (or two environments)
/// pointed at the same root path stay isolated the way separate Mongo
/// database names would in the original deployment; `MemoryStore` has no
/// on-disk footprint to namespace and ignores it.
pub async fn open_store(uri: &str, db: &str) -> Result<Arc<dyn Store>, StoreError> {
    if let Some(path) = uri.strip_prefix("file://") {
        let dir = Path::new(path).join(db);
        Ok(Arc::new(FileJournalStore::open(dir).await?))
    } else {
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazily_creates_device_row_on_first_upsert() {
        let store = MemoryStore::new();
        assert!(store.load_device("123").await.is_none());
        store
            .upsert_device(
                "123",
                PartialDeviceUpdate {
                    ignition_on: Some(true),
                    ..Default::default()
                },
            )
            .await;
        let dev = store.load_device("123").await.unwrap();
        assert!(dev.ignition_on);
    }

    #[tokio::test]
    async fn request_block_sets_pending_flag() {
        let store = MemoryStore::new();
        store.request_block("123", true).await;
        let dev = store.load_device("123").await.unwrap();
        assert_eq!(dev.block_cmd_pending, Some(true));
    }

    #[tokio::test]
    async fn file_journal_store_persists_across_reopen() {
        let dir = tempdir();
        {
            let store = FileJournalStore::open(&dir).await.unwrap();
            store.request_block("123", true).await;
        }
        let reopened = FileJournalStore::open(&dir).await.unwrap();
        let dev = reopened.load_device("123").await.unwrap();
        assert_eq!(dev.block_cmd_pending, Some(true));
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("gv50-store-test-{}", std::process::id()));
        p
    }
}
