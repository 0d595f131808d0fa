//! Warp sync: content-addressed snapshots of the whole database.
//!
//! A snapshot is a plain SQLite file named
//! `<sha256hex>-<networkId>-<schemaVersion>.warp`. The hash covers the file
//! bytes, so an import can verify the artifact before touching anything.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use marketsync_core::error::IndexerError;

use crate::sqlite::{storage, Store};

pub const WARP_EXTENSION: &str = "warp";

/// The parsed name of a warp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpFileName {
    pub hash: String,
    pub network_id: String,
    pub schema_version: u32,
}

impl WarpFileName {
    pub fn new(hash: impl Into<String>, network_id: impl Into<String>, schema_version: u32) -> Self {
        Self {
            hash: hash.into(),
            network_id: network_id.into(),
            schema_version,
        }
    }

    /// Parse `<hash>-<network>-<version>.warp` from the final path component.
    pub fn parse(path: &Path) -> Result<Self, IndexerError> {
        let bad = || IndexerError::Snapshot(format!("not a warp file name: {}", path.display()));
        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(bad)?;
        let stem = name
            .strip_suffix(&format!(".{WARP_EXTENSION}"))
            .ok_or_else(bad)?;
        let (hash, rest) = stem.split_once('-').ok_or_else(bad)?;
        let (network_id, version) = rest.rsplit_once('-').ok_or_else(bad)?;

        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) || network_id.is_empty() {
            return Err(bad());
        }
        let schema_version = version.parse().map_err(|_| bad())?;
        Ok(Self::new(hash.to_ascii_lowercase(), network_id, schema_version))
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.{WARP_EXTENSION}",
            self.hash, self.network_id, self.schema_version
        )
    }

    fn same_series(&self, other: &Self) -> bool {
        self.network_id == other.network_id && self.schema_version == other.schema_version
    }
}

// ─── Database files ──────────────────────────────────────────────────────────

pub fn database_file_name(network_id: &str, schema_version: u32) -> String {
    format!("marketsync-{network_id}-{schema_version}.db")
}

pub fn database_path(dir: &Path, network_id: &str, schema_version: u32) -> PathBuf {
    dir.join(database_file_name(network_id, schema_version))
}

/// Highest schema version among the database files for `network_id` in `dir`.
pub async fn highest_db_version(dir: &Path, network_id: &str) -> Result<Option<u32>, IndexerError> {
    let prefix = format!("marketsync-{network_id}-");
    let mut highest = None;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|rest| rest.strip_suffix(".db"))
            .and_then(|v| v.parse::<u32>().ok())
        else {
            continue;
        };
        highest = highest.max(Some(version));
    }
    Ok(highest)
}

fn side_files(db_path: &Path) -> [PathBuf; 3] {
    let base = db_path.as_os_str().to_owned();
    let with = |suffix: &str| {
        let mut s = base.clone();
        s.push(suffix);
        PathBuf::from(s)
    };
    [db_path.to_path_buf(), with("-wal"), with("-shm")]
}

/// Move the database at `db_path` (and its WAL/SHM files) aside to
/// `<name>.bak-<timestamp>`. Returns the new main-file path, or `None` if
/// there was no database.
pub async fn retire_database(db_path: &Path) -> Result<Option<PathBuf>, IndexerError> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let mut retired = None;
    for (i, file) in side_files(db_path).iter().enumerate() {
        if !tokio::fs::try_exists(file).await? {
            continue;
        }
        let mut target = file.as_os_str().to_owned();
        target.push(format!(".bak-{stamp}"));
        let target = PathBuf::from(target);
        tokio::fs::rename(file, &target).await?;
        debug!(from = %file.display(), to = %target.display(), "database file retired");
        if i == 0 {
            retired = Some(target);
        }
    }
    Ok(retired)
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

/// Lowercase hex SHA-256 of a file's contents.
pub async fn file_sha256(path: &Path) -> Result<String, IndexerError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, IndexerError> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| IndexerError::Snapshot(format!("hash task failed: {e}")))?
}

// ─── Export / import ─────────────────────────────────────────────────────────

/// Write a consistent copy of `store` into `dest_dir` as a warp file.
///
/// Older warp files for the same network and schema version are removed.
/// Only file-backed stores can be exported.
pub async fn export_snapshot(
    store: &Store,
    schema_version: u32,
    dest_dir: &Path,
) -> Result<PathBuf, IndexerError> {
    if store.path().is_none() {
        return Err(IndexerError::Snapshot("in-memory store cannot be exported".into()));
    }
    tokio::fs::create_dir_all(dest_dir).await?;
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let temp = dest_dir.join(format!(".warp-export-{}-{nanos}.tmp", std::process::id()));
    let temp_str = temp
        .to_str()
        .ok_or_else(|| IndexerError::Snapshot(format!("non UTF-8 path {}", temp.display())))?;

    sqlx::query(&format!("VACUUM INTO '{}'", temp_str.replace('\'', "''")))
        .execute(store.pool())
        .await
        .map_err(storage)?;

    let hash = match file_sha256(&temp).await {
        Ok(hash) => hash,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
    };
    let name = WarpFileName::new(hash, store.network_id(), schema_version);
    let target = dest_dir.join(name.file_name());
    tokio::fs::rename(&temp, &target).await?;

    let mut entries = tokio::fs::read_dir(dest_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Ok(other) = WarpFileName::parse(&path) else {
            continue;
        };
        if other.same_series(&name) && other.hash != name.hash {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not remove stale warp file");
            }
        }
    }

    info!(path = %target.display(), "warp snapshot exported");
    Ok(target)
}

/// Replace the database at `db_path` with the snapshot at `src`.
///
/// The caller must have stopped everything using the database. The snapshot
/// must match `network_id`/`schema_version` and its recomputed hash must match
/// its name; otherwise nothing on disk changes. Returns the retired copy of
/// the previous database, if there was one.
pub async fn import_snapshot(
    db_path: &Path,
    network_id: &str,
    schema_version: u32,
    src: &Path,
) -> Result<Option<PathBuf>, IndexerError> {
    let name = WarpFileName::parse(src)?;
    if name.network_id != network_id || name.schema_version != schema_version {
        return Err(IndexerError::Snapshot(format!(
            "warp file is for network {} version {}, expected network {network_id} version {schema_version}",
            name.network_id, name.schema_version
        )));
    }

    let actual = file_sha256(src).await?;
    if actual != name.hash {
        warn!(file = %src.display(), expected = %name.hash, actual = %actual, "warp file hash mismatch");
        return Err(IndexerError::SnapshotIntegrity {
            expected: name.hash,
            actual,
        });
    }

    let mut staging = db_path.as_os_str().to_owned();
    staging.push(".staging");
    let staging = PathBuf::from(staging);
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, &staging).await?;

    let retired = match retire_database(db_path).await {
        Ok(retired) => retired,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&staging, db_path).await?;

    info!(
        db = %db_path.display(),
        snapshot = %src.display(),
        retired = ?retired,
        "warp snapshot imported"
    );
    Ok(retired)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_mutation;
    use crate::sqlite::{upsert_block, SCHEMA_VERSION};
    use marketsync_core::mutation::{Mutation, NewMarket, NewOrder};
    use marketsync_core::types::{BlockSummary, OrderType, ReportingState};

    const HASH: &str = "ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12";

    /// File-backed store with a few blocks, a market and an order.
    async fn populated_store(dir: &Path) -> Store {
        let store = Store::open(dir.join("source.db"), "1").await.unwrap();
        let mut tx = store.begin().await.unwrap();
        for n in 1..=3u64 {
            let block = BlockSummary {
                number: n,
                hash: format!("0x{n}"),
                parent_hash: format!("0x{}", n - 1),
                timestamp: Some(n as i64 * 12),
            };
            upsert_block(&mut tx, &block, n as i64 * 12, true).await.unwrap();
        }
        for m in [
            Mutation::InsertMarket(NewMarket {
                market_id: "0xm".into(),
                universe: "0xu".into(),
                creator: "0xc".into(),
                num_outcomes: 2,
                end_time: 99,
                block_number: 2,
            }),
            Mutation::SetMarketState {
                market_id: "0xm".into(),
                state: ReportingState::PreReporting,
                block_number: 2,
            },
            Mutation::InsertOrder(NewOrder {
                order_id: "0xo".into(),
                market_id: "0xm".into(),
                outcome: 1,
                order_type: OrderType::Buy,
                price: 7,
                amount: 3,
                block_number: 3,
                transaction_hash: "0xt".into(),
            }),
        ] {
            apply_mutation(&mut tx, &m).await.unwrap();
        }
        tx.commit().await.unwrap();
        store
    }

    #[test]
    fn warp_name_roundtrip_and_rejects() {
        let name = WarpFileName::new(HASH, "1", 4);
        let parsed = WarpFileName::parse(Path::new(&name.file_name())).unwrap();
        assert_eq!(parsed, name);

        let bad_names = [
            "nothash-1-1.warp".to_string(),
            format!("{HASH}-1-x.warp"),
            format!("{HASH}-1-1.db"),
            format!("{HASH}--1.warp"),
        ];
        for bad in &bad_names {
            assert!(WarpFileName::parse(Path::new(bad)).is_err(), "{bad}");
        }
    }

    #[test]
    fn network_ids_may_contain_dashes() {
        let parsed = WarpFileName::parse(Path::new(&format!("{HASH}-dev-net-2.warp"))).unwrap();
        assert_eq!(parsed.network_id, "dev-net");
        assert_eq!(parsed.schema_version, 2);
    }

    #[tokio::test]
    async fn export_names_file_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path()).await;
        let path = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();

        let name = WarpFileName::parse(&path).unwrap();
        assert_eq!(name.network_id, "1");
        assert_eq!(name.hash, file_sha256(&path).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_store_is_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory("1").await.unwrap();
        let err = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexerError::Snapshot(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn export_replaces_older_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(WarpFileName::new(HASH, "1", SCHEMA_VERSION).file_name());
        let other_network = dir.path().join(WarpFileName::new(HASH, "4", SCHEMA_VERSION).file_name());
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&other_network, b"other").unwrap();

        let store = populated_store(dir.path()).await;
        let path = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();

        assert!(path.exists());
        assert!(!stale.exists());
        assert!(other_network.exists());
    }

    #[tokio::test]
    async fn export_then_import_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path()).await;
        let warp = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();

        let db_path = database_path(dir.path(), "1", SCHEMA_VERSION);
        let retired = import_snapshot(&db_path, "1", SCHEMA_VERSION, &warp).await.unwrap();
        assert!(retired.is_none());

        let imported = Store::open(&db_path, "1").await.unwrap();
        assert_eq!(imported.blocks().await.unwrap(), store.blocks().await.unwrap());
        assert_eq!(imported.markets().await.unwrap(), store.markets().await.unwrap());
        assert_eq!(imported.orders().await.unwrap(), store.orders().await.unwrap());
    }

    #[tokio::test]
    async fn tampered_snapshot_leaves_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path()).await;
        let warp = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();

        let db_path = database_path(dir.path(), "1", SCHEMA_VERSION);
        std::fs::write(&db_path, b"current database bytes").unwrap();
        let before = std::fs::read(&db_path).unwrap();

        let tampered = dir
            .path()
            .join(WarpFileName::new(HASH, "1", SCHEMA_VERSION).file_name());
        std::fs::copy(&warp, &tampered).unwrap();

        let err = import_snapshot(&db_path, "1", SCHEMA_VERSION, &tampered)
            .await
            .unwrap_err();
        assert!(err.is_integrity_failure());
        assert_eq!(std::fs::read(&db_path).unwrap(), before);
    }

    #[tokio::test]
    async fn import_retires_previous_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path()).await;
        let warp = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();

        let db_path = database_path(dir.path(), "1", SCHEMA_VERSION);
        std::fs::write(&db_path, b"previous").unwrap();

        let retired = import_snapshot(&db_path, "1", SCHEMA_VERSION, &warp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&retired).unwrap(), b"previous");
        assert_eq!(file_sha256(&db_path).await.unwrap(), WarpFileName::parse(&warp).unwrap().hash);
    }

    #[tokio::test]
    async fn import_rejects_other_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated_store(dir.path()).await;
        let warp = export_snapshot(&store, SCHEMA_VERSION, dir.path()).await.unwrap();
        let db_path = database_path(dir.path(), "4", SCHEMA_VERSION);
        assert!(import_snapshot(&db_path, "4", SCHEMA_VERSION, &warp).await.is_err());
        assert!(!db_path.exists());
    }

    #[tokio::test]
    async fn highest_version_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(highest_db_version(dir.path(), "1").await.unwrap(), None);
        for name in ["marketsync-1-1.db", "marketsync-1-3.db", "marketsync-4-9.db", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(highest_db_version(dir.path(), "1").await.unwrap(), Some(3));
    }
}
