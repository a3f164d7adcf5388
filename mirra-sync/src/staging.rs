//! Staged-commit helper
//!
//! Bound to one session's shadow directories. Incoming files and pending
//! deletions are staged outside the live tree and applied only on an
//! explicit commit, so an interrupted session never leaves the live tree
//! half-synced. Incoming files are moved (not copied) into place one at
//! a time, in order: incoming moves, then removals, then renames.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, trace, warn};

use mirra_index::from_wire_path;

use crate::errors::{Result, SyncError};

/// Stages incoming files and pending removals for one session.
pub struct Stager {
    root: PathBuf,
    incoming_dir: PathBuf,
    removal_dir: PathBuf,
    incoming: Vec<String>,
    removals: Vec<String>,
    renames: Vec<(String, String)>,
}

impl Stager {
    pub fn new(
        root: impl Into<PathBuf>,
        incoming_dir: impl Into<PathBuf>,
        removal_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            incoming_dir: incoming_dir.into(),
            removal_dir: removal_dir.into(),
            incoming: Vec::new(),
            removals: Vec::new(),
            renames: Vec::new(),
        }
    }

    /// Create both shadow directories.
    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.incoming_dir).await?;
        fs::create_dir_all(&self.removal_dir).await?;
        Ok(())
    }

    pub fn incoming_dir(&self) -> &Path {
        &self.incoming_dir
    }

    pub fn removal_dir(&self) -> &Path {
        &self.removal_dir
    }

    /// Record an incoming file and return the shadow path the caller
    /// should write its body to. Parent directories are created.
    pub async fn stage_incoming(&mut self, path: &str) -> Result<PathBuf> {
        let relative = from_wire_path(path)?;
        let shadow = self.incoming_dir.join(&relative);
        if let Some(parent) = shadow.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !self.incoming.iter().any(|p| p == path) {
            self.incoming.push(path.to_string());
        }
        trace!("Staged incoming file {} at {:?}", path, shadow);
        Ok(shadow)
    }

    /// Drop a previously staged incoming file, deleting its shadow copy.
    /// Used when a transfer fails its integrity check.
    pub async fn discard_incoming(&mut self, path: &str) -> Result<()> {
        let relative = from_wire_path(path)?;
        let shadow = self.incoming_dir.join(&relative);
        match fs::remove_file(&shadow).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.incoming.retain(|p| p != path);
        debug!("Discarded staged incoming file {}", path);
        Ok(())
    }

    /// Record a pending deletion and immediately move the live file into
    /// the removal shadow directory, so the live tree never shows a file
    /// that is supposed to be gone.
    pub async fn stage_removal(&mut self, path: &str) -> Result<()> {
        let relative = from_wire_path(path)?;
        let live = self.root.join(&relative);
        let shadow = self.removal_dir.join(&relative);

        match fs::metadata(&live).await {
            Ok(_) => {
                if let Some(parent) = shadow.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&live, &shadow).await?;
                self.removals.push(path.to_string());
                trace!("Staged removal of {} into {:?}", path, shadow);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Removal target already gone: {}", path);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Record a rename, applied directly to the live tree at commit time.
    pub fn stage_rename(&mut self, from: &str, to: &str) {
        self.renames.push((from.to_string(), to.to_string()));
    }

    /// Apply all staged changes to the live tree.
    ///
    /// Incoming files replace any pre-existing file at their final path;
    /// removal shadows are deleted permanently; renames move live files
    /// directly. Both shadow directories must be empty afterwards, and a
    /// leftover file is surfaced as an internal error.
    pub async fn commit(&mut self) -> Result<()> {
        for path in std::mem::take(&mut self.incoming) {
            let relative = from_wire_path(&path)?;
            let shadow = self.incoming_dir.join(&relative);
            let live = self.root.join(&relative);

            if let Some(parent) = live.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::remove_file(&live).await {
                Ok(()) => trace!("Replaced existing file {}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::rename(&shadow, &live).await?;
            debug!("Committed incoming file {}", path);
        }

        for path in std::mem::take(&mut self.removals) {
            let relative = from_wire_path(&path)?;
            let shadow = self.removal_dir.join(&relative);
            match fs::remove_file(&shadow).await {
                Ok(()) => debug!("Committed removal of {}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Removal shadow already gone: {}", path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for (from, to) in std::mem::take(&mut self.renames) {
            let src = self.root.join(from_wire_path(&from)?);
            let dst = self.root.join(from_wire_path(&to)?);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&src, &dst).await?;
            debug!("Committed rename {} -> {}", from, to);
        }

        // A leftover file here means something was staged outside the
        // helper's bookkeeping; that is a protocol defect, not noise.
        if let Some(stray) = first_file_under(&self.incoming_dir).await? {
            return Err(SyncError::DirtyShadow(stray));
        }
        if let Some(stray) = first_file_under(&self.removal_dir).await? {
            return Err(SyncError::DirtyShadow(stray));
        }

        remove_dir_if_present(&self.incoming_dir).await?;
        remove_dir_if_present(&self.removal_dir).await?;

        // Both shadows shared one scratch parent; remove_dir refuses
        // anything non-empty, so a foreign parent survives this.
        if let Some(parent) = self.incoming_dir.parent() {
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

/// Find any regular file below `dir`, ignoring empty directories.
async fn first_file_under(dir: &Path) -> Result<Option<PathBuf>> {
    let mut dirs = vec![dir.to_path_buf()];
    while let Some(current) = dirs.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
