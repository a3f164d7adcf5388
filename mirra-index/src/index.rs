//! Persisted per-root sync index
//!
//! The ledger lives in a hidden subdirectory of the synchronized root and
//! maps relative path to the digest recorded at the end of the last
//! completed session. On load the ledger is reconciled against a live
//! directory scan, promoting entries to `New`/`Modified`/`Deleted`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, trace, warn};

use mirra_proto::{FileRecord, FileState};

use crate::digest::{hash_file, DigestProvider};
use crate::errors::{IndexError, Result};

/// Conventional hidden subdirectory of a sync root.
pub const INDEX_DIR_NAME: &str = ".mirra";

/// Ledger file name inside the index directory.
pub const LEDGER_FILE_NAME: &str = "index.json";

const LEDGER_VERSION: u32 = 1;

/// Configuration for directory scanning.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// File name patterns to skip while walking (basic glob patterns).
    pub ignore_patterns: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![
                ".git".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
            ],
        }
    }
}

/// Persisted ledger document.
#[derive(Debug, Serialize, Deserialize)]
struct Ledger {
    version: u32,
    generated_at: DateTime<Utc>,
    files: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    path: String,
    digest: String,
}

/// Convert a root-relative filesystem path to its wire form
/// (`/`-separated, no leading separator).
pub fn to_wire_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Convert a wire path back to a relative [`PathBuf`], rejecting anything
/// that could escape the root (absolute paths, `..` components).
pub fn from_wire_path(wire: &str) -> Result<PathBuf> {
    if wire.is_empty() {
        return Err(IndexError::PathOutsideRoot(wire.to_string()));
    }
    let mut out = PathBuf::new();
    for part in wire.split(['/', '\\']) {
        match part {
            "" | "." | ".." => return Err(IndexError::PathOutsideRoot(wire.to_string())),
            normal => out.push(normal),
        }
    }
    Ok(out)
}

/// Owned set of [`FileRecord`]s for one synchronized root, unique by path.
pub struct SyncIndex {
    root: PathBuf,
    index_dir: PathBuf,
    provider: Arc<dyn DigestProvider>,
    config: IndexConfig,
    records: HashMap<String, FileRecord>,
}

impl SyncIndex {
    /// Load the persisted ledger, marking every entry `NotChanged`
    /// pending reconciliation. Returns `None` if no ledger exists; a
    /// corrupt or unreadable ledger is treated the same way and the
    /// caller rebuilds from a full scan.
    pub async fn load(
        root: impl AsRef<Path>,
        index_dir: impl AsRef<Path>,
        provider: Arc<dyn DigestProvider>,
        config: IndexConfig,
    ) -> Option<SyncIndex> {
        let root = root.as_ref().to_path_buf();
        let index_dir = index_dir.as_ref().to_path_buf();
        let ledger_path = index_dir.join(LEDGER_FILE_NAME);

        let bytes = match fs::read(&ledger_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Unreadable ledger {:?}, rebuilding index: {}", ledger_path, e);
                return None;
            }
        };

        let ledger: Ledger = match serde_json::from_slice(&bytes) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("Corrupt ledger {:?}, rebuilding index: {}", ledger_path, e);
                return None;
            }
        };

        let mut records = HashMap::with_capacity(ledger.files.len());
        for entry in ledger.files {
            records.insert(
                entry.path.clone(),
                FileRecord::new(entry.path, entry.digest, FileState::NotChanged),
            );
        }

        debug!("Loaded ledger with {} records from {:?}", records.len(), ledger_path);

        Some(SyncIndex {
            root,
            index_dir,
            provider,
            config,
            records,
        })
    }

    /// Build a fresh index with a full-tree scan, hashing every file
    /// outside the index directory. All records start as `New`.
    pub async fn initialize(
        root: impl AsRef<Path>,
        index_dir: impl AsRef<Path>,
        provider: Arc<dyn DigestProvider>,
        config: IndexConfig,
    ) -> Result<SyncIndex> {
        let mut index = SyncIndex {
            root: root.as_ref().to_path_buf(),
            index_dir: index_dir.as_ref().to_path_buf(),
            provider,
            config,
            records: HashMap::new(),
        };

        let files = index.walk_root().await?;
        info!("Initializing index: {} files under {:?}", files.len(), index.root);

        for path in files {
            let digest = hash_file(index.provider.as_ref(), &path).await?;
            let wire = to_wire_path(path.strip_prefix(&index.root).unwrap_or(&path));
            index
                .records
                .insert(wire.clone(), FileRecord::new(wire, digest, FileState::New));
        }

        Ok(index)
    }

    /// Load the ledger and reconcile it, or fall back to a fresh scan.
    pub async fn load_or_initialize(
        root: impl AsRef<Path>,
        index_dir: impl AsRef<Path>,
        provider: Arc<dyn DigestProvider>,
        config: IndexConfig,
    ) -> Result<SyncIndex> {
        match SyncIndex::load(&root, &index_dir, provider.clone(), config.clone()).await {
            Some(mut index) => {
                index.reconcile().await?;
                Ok(index)
            }
            None => SyncIndex::initialize(root, index_dir, provider, config).await,
        }
    }

    /// Diff the loaded ledger against the live tree: records missing on
    /// disk become `Deleted`, records with a changed digest become
    /// `Modified`, and files without a ledger entry are appended as `New`.
    pub async fn reconcile(&mut self) -> Result<()> {
        let mut seen = 0usize;

        let paths: Vec<String> = self.records.keys().cloned().collect();
        for wire in paths {
            let absolute = self.root.join(from_wire_path(&wire)?);
            match fs::metadata(&absolute).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    trace!("Record gone from disk: {}", wire);
                    if let Some(record) = self.records.get_mut(&wire) {
                        record.state = FileState::Deleted;
                    }
                }
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    seen += 1;
                    let digest = hash_file(self.provider.as_ref(), &absolute).await?;
                    if let Some(record) = self.records.get_mut(&wire) {
                        if record.digest != digest {
                            trace!("Record changed on disk: {}", wire);
                            // The ledger digest stays: it names the last
                            // synced content. Transfers upsert the new
                            // digest once it has actually moved.
                            record.state = FileState::Modified;
                        }
                    }
                }
            }
        }

        // Pick up files the ledger has never seen.
        let mut new_files = 0usize;
        for path in self.walk_root().await? {
            let wire = to_wire_path(path.strip_prefix(&self.root).unwrap_or(&path));
            if !self.records.contains_key(&wire) {
                let digest = hash_file(self.provider.as_ref(), &path).await?;
                self.records
                    .insert(wire.clone(), FileRecord::new(wire, digest, FileState::New));
                new_files += 1;
            }
        }

        debug!(
            "Reconciled index: {} on disk, {} new, {} total records",
            seen,
            new_files,
            self.records.len()
        );
        Ok(())
    }

    /// Persist the ledger inside the index directory, creating it if
    /// absent. `Deleted` records are dropped; everything else is written
    /// back and will reload as `NotChanged`.
    pub async fn store(&self) -> Result<()> {
        fs::create_dir_all(&self.index_dir).await?;

        let mut files: Vec<LedgerEntry> = self
            .records
            .values()
            .filter(|r| r.state != FileState::Deleted)
            .map(|r| LedgerEntry {
                path: r.path.clone(),
                digest: r.digest.clone(),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let ledger = Ledger {
            version: LEDGER_VERSION,
            generated_at: Utc::now(),
            files,
        };

        // Write-then-rename so a crash never leaves a truncated ledger.
        let final_path = self.index_dir.join(LEDGER_FILE_NAME);
        let temp_path = self.index_dir.join(format!("{}.tmp", LEDGER_FILE_NAME));
        fs::write(&temp_path, serde_json::to_vec_pretty(&ledger)?).await?;
        fs::rename(&temp_path, &final_path).await?;

        debug!("Stored ledger with {} records at {:?}", ledger.files.len(), final_path);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    /// Insert or replace the record for a path.
    pub fn upsert(&mut self, record: FileRecord) {
        self.records.insert(record.path.clone(), record);
    }

    /// Drop the record for a path, if any.
    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.records.remove(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of all records, sorted by path for deterministic output.
    pub fn to_records(&self) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    /// Walk the root collecting regular files, skipping the index
    /// directory and ignore patterns.
    async fn walk_root(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dirs_to_process = vec![self.root.clone()];

        while let Some(current_dir) = dirs_to_process.pop() {
            let mut entries = fs::read_dir(&current_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();

                if path.starts_with(&self.index_dir) {
                    continue;
                }
                if self.should_ignore(&path) {
                    trace!("Ignoring path: {:?}", path);
                    continue;
                }

                let file_type = entry.file_type().await?;
                if file_type.is_file() {
                    files.push(path);
                } else if file_type.is_dir() {
                    dirs_to_process.push(path);
                }
                // Symlinks are not followed.
            }
        }

        files.sort();
        Ok(files)
    }

    fn should_ignore(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        for pattern in &self.config.ignore_patterns {
            if pattern.contains('*') {
                if glob_match(pattern, name) {
                    return true;
                }
            } else if name == pattern {
                return true;
            }
        }

        false
    }
}

/// Simple glob matching for ignore patterns (`*` prefix or suffix only).
fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Blake3Provider;
    use tempfile::tempdir;

    fn provider() -> Arc<dyn DigestProvider> {
        Arc::new(Blake3Provider)
    }

    async fn make_index(root: &Path) -> SyncIndex {
        SyncIndex::load_or_initialize(
            root,
            root.join(INDEX_DIR_NAME),
            provider(),
            IndexConfig::default(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_wire_path_round_trip() {
        let rel = PathBuf::from("docs").join("sub").join("file.txt");
        let wire = to_wire_path(&rel);
        assert_eq!(wire, "docs/sub/file.txt");
        assert_eq!(from_wire_path(&wire).unwrap(), rel);
    }

    #[test]
    fn test_wire_path_rejects_escapes() {
        assert!(from_wire_path("../etc/passwd").is_err());
        assert!(from_wire_path("/etc/passwd").is_err());
        assert!(from_wire_path("a/../../b").is_err());
        assert!(from_wire_path("").is_err());
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_match("*.tmp", "upload.tmp"));
        assert!(glob_match("cache*", "cache01"));
        assert!(!glob_match("*.tmp", "upload.txt"));
    }

    #[tokio::test]
    async fn test_initialize_marks_new() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"alpha").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), b"beta").await.unwrap();

        let index = make_index(dir.path()).await;

        assert_eq!(index.len(), 2);
        for record in index.to_records() {
            assert_eq!(record.state, FileState::New);
        }
        assert!(index.get("sub/b.txt").is_some());
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"alpha").await.unwrap();

        let index = make_index(dir.path()).await;
        index.store().await.unwrap();

        let reloaded = SyncIndex::load(
            dir.path(),
            dir.path().join(INDEX_DIR_NAME),
            provider(),
            IndexConfig::default(),
        )
        .await
        .expect("ledger should exist");

        assert_eq!(reloaded.len(), 1);
        let record = reloaded.get("a.txt").unwrap();
        assert_eq!(record.state, FileState::NotChanged);
        assert_eq!(record.digest, index.get("a.txt").unwrap().digest);
    }

    #[tokio::test]
    async fn test_reconcile_classifies_changes() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("keep.txt"), b"same").await.unwrap();
        tokio::fs::write(dir.path().join("change.txt"), b"before").await.unwrap();
        tokio::fs::write(dir.path().join("gone.txt"), b"bye").await.unwrap();

        let index = make_index(dir.path()).await;
        index.store().await.unwrap();

        tokio::fs::write(dir.path().join("change.txt"), b"after").await.unwrap();
        tokio::fs::remove_file(dir.path().join("gone.txt")).await.unwrap();
        tokio::fs::write(dir.path().join("fresh.txt"), b"hello").await.unwrap();

        let reloaded = make_index(dir.path()).await;

        assert_eq!(reloaded.get("keep.txt").unwrap().state, FileState::NotChanged);
        assert_eq!(reloaded.get("change.txt").unwrap().state, FileState::Modified);
        assert_eq!(reloaded.get("gone.txt").unwrap().state, FileState::Deleted);
        assert_eq!(reloaded.get("fresh.txt").unwrap().state, FileState::New);
    }

    #[tokio::test]
    async fn test_modified_record_keeps_ledger_digest() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"synced").await.unwrap();

        let index = make_index(dir.path()).await;
        let synced_digest = index.get("a.txt").unwrap().digest.clone();
        index.store().await.unwrap();

        tokio::fs::write(dir.path().join("a.txt"), b"edited").await.unwrap();
        let reloaded = make_index(dir.path()).await;

        // The record still carries the last-synced digest, so an
        // untransferred edit is re-detected on every load.
        let record = reloaded.get("a.txt").unwrap();
        assert_eq!(record.state, FileState::Modified);
        assert_eq!(record.digest, synced_digest);

        reloaded.store().await.unwrap();
        let again = make_index(dir.path()).await;
        assert_eq!(again.get("a.txt").unwrap().state, FileState::Modified);
        assert_eq!(again.get("a.txt").unwrap().digest, synced_digest);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_rebuilds() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"alpha").await.unwrap();

        let index_dir = dir.path().join(INDEX_DIR_NAME);
        tokio::fs::create_dir_all(&index_dir).await.unwrap();
        tokio::fs::write(index_dir.join(LEDGER_FILE_NAME), b"{ not json")
            .await
            .unwrap();

        let index = make_index(dir.path()).await;
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a.txt").unwrap().state, FileState::New);
    }

    #[tokio::test]
    async fn test_index_dir_excluded_from_scan() {
        let dir = tempdir().unwrap();
        let index_dir = dir.path().join(INDEX_DIR_NAME);
        tokio::fs::create_dir_all(&index_dir).await.unwrap();
        tokio::fs::write(index_dir.join("scratch.bin"), b"internal").await.unwrap();
        tokio::fs::write(dir.path().join("real.txt"), b"data").await.unwrap();

        let index = make_index(dir.path()).await;
        assert_eq!(index.len(), 1);
        assert!(index.get("real.txt").is_some());
    }

    #[tokio::test]
    async fn test_deleted_records_dropped_on_store() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"alpha").await.unwrap();

        let index = make_index(dir.path()).await;
        index.store().await.unwrap();

        tokio::fs::remove_file(dir.path().join("a.txt")).await.unwrap();
        let reloaded = make_index(dir.path()).await;
        assert_eq!(reloaded.get("a.txt").unwrap().state, FileState::Deleted);
        reloaded.store().await.unwrap();

        let after = make_index(dir.path()).await;
        assert!(after.get("a.txt").is_none());
    }
}
