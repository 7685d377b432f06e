//! # Persistence Module - Durable State Snapshots
//!
//! Writes the node tracker's state to a single JSON document and restores it
//! at startup, so a restart picks up where the live stream left off.
//!
//! ## Features
//!
//! - **Atomic Writes**: snapshots go to a unique temp file in the target
//!   directory, get flushed and fsynced, then rename over the previous file.
//!   A crash mid-write leaves the old snapshot intact.
//! - **Tolerant Loads**: a missing file starts the store empty; a corrupt
//!   file is logged and treated as missing; an unreadable node entry is
//!   skipped without losing its neighbors. Startup never fails on state.
//! - **Coalescing Throttle**: bursts of dirty state collapse into at most
//!   one save per configured window; shutdown forces a final save.
//! - **Instance Locking**: an exclusive advisory lock on the data directory
//!   keeps a second tracker from fighting over the same snapshot file.
//!
//! ## File Layout
//!
//! One JSON object keyed by canonical node id. Each value mirrors
//! [`NodeState`](crate::tracker::NodeState): `last_seen`, `position_history`
//! (`[{timestamp, lat, lon, alt}]`), `packets`, node metadata, and the
//! per-gateway observation map. Schema evolution is additive-only: new
//! fields are optional with serde defaults, and unknown fields are ignored
//! on load, so older readers keep working.

use crate::tracker::NodeState;
use fs2::FileExt;
use log::{info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Persistence failures. Saves are retried on a later throttle tick; the
/// in-memory state that failed to persist is never lost.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("data directory already locked by another instance")]
    AlreadyLocked,
}

/// Owns the snapshot file and the instance lock.
pub struct StateStore {
    state_path: PathBuf,
    // Held for the process lifetime; dropping releases the advisory lock.
    _lock: File,
}

impl StateStore {
    /// Prepare the data directory and take the instance lock.
    pub fn new(data_dir: &str, state_file: &str) -> Result<Self, PersistError> {
        let dir = PathBuf::from(data_dir);
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join("meshwatch.lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| PersistError::AlreadyLocked)?;

        Ok(Self {
            state_path: dir.join(state_file),
            _lock: lock,
        })
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Load the last snapshot. Degrades to an empty map on any failure.
    pub fn load(&self) -> HashMap<String, NodeState> {
        read_snapshot(&self.state_path)
    }

    /// Atomically replace the snapshot file with `nodes`.
    pub fn save(&self, nodes: &HashMap<String, NodeState>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(nodes)?;
        write_atomic(&self.state_path, content.as_bytes())?;
        Ok(())
    }
}

/// Read a snapshot file without taking the instance lock (used by the
/// `status` command against a possibly-running tracker).
pub fn read_snapshot(path: &Path) -> HashMap<String, NodeState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no existing state file at {}, starting fresh", path.display());
            return HashMap::new();
        }
        Err(e) => {
            warn!("unreadable state file {}: {} (starting fresh)", path.display(), e);
            return HashMap::new();
        }
    };

    // Guard against accidental leading NULs from previous partial writes.
    let cleaned = content.trim_start_matches('\0');
    let raw: HashMap<String, Value> = match serde_json::from_str(cleaned) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                "corrupt state file {}: {} (starting fresh)",
                path.display(),
                e
            );
            return HashMap::new();
        }
    };

    let mut nodes = HashMap::with_capacity(raw.len());
    let mut skipped = 0usize;
    for (node_id, value) in raw {
        match serde_json::from_value::<NodeState>(value) {
            Ok(state) => {
                nodes.insert(node_id, state);
            }
            Err(e) => {
                warn!("skipping unreadable node entry {}: {}", node_id, e);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("dropped {} unreadable node entries from snapshot", skipped);
    }
    info!("loaded {} nodes from {}", nodes.len(), path.display());
    nodes
}

/// Write to a unique temp file in the destination directory, flush, fsync,
/// then rename over the destination and fsync the directory. Never writes
/// in place.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.json");

    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                tmp.sync_all()?;
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

/// Coalesces save requests: any number of dirty marks inside the window
/// produce one save, and a failed save stays dirty for the next tick.
#[derive(Debug)]
pub struct SaveThrottle {
    min_interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
}

impl SaveThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_save: None,
            dirty: false,
        }
    }

    /// Note that state changed; an eventual save is now owed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a save should run now. `force` bypasses the window (shutdown)
    /// but never invents work when the state is clean.
    pub fn should_save(&self, force: bool) -> bool {
        if !self.dirty {
            return false;
        }
        if force {
            return true;
        }
        match self.last_save {
            None => true,
            Some(at) => at.elapsed() >= self.min_interval,
        }
    }

    /// Record a completed save.
    pub fn saved(&mut self) {
        self.dirty = false;
        self.last_save = Some(Instant::now());
    }
}
