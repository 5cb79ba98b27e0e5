//! Persistence backends for the session store.

use crate::message::ThreadKey;
use crate::session::StoreError;
use fs4::fs_std::FileExt;
use relay_common::error::{Error, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Session recorded for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id issued by the assistant process
    pub session_id: String,
    /// Working directory the session runs in
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, cwd: Option<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd,
        }
    }
}

/// The full persisted mapping, ordered for stable file output.
pub type SessionMap = BTreeMap<ThreadKey, SessionRecord>;

/// Storage for the complete session map.
///
/// Backends are called from the blocking pool and must make `save`
/// all-or-nothing: after a failed or interrupted save, `load` returns either
/// the previous map or the new one.
pub trait SessionBackend: Send + Sync + 'static {
    /// Human-readable location for logs and errors.
    fn location(&self) -> String;

    /// Load the persisted map. `Ok(None)` when nothing has been persisted.
    ///
    /// Unparsable state must surface as a JSON error so the caller can tell
    /// corruption from I/O failure.
    fn load(&self) -> Result<Option<SessionMap>>;

    /// Replace the persisted map.
    fn save(&self, sessions: &SessionMap) -> Result<()>;

    /// Move unparsable state out of the way, returning where it went.
    fn quarantine(&self) -> Result<Option<PathBuf>>;
}

// ============================================================================
// JSON file backend
// ============================================================================

/// Session map stored as one pretty-printed JSON file.
///
/// Writes go to a temporary file in the same directory, are fsynced, then
/// renamed over the target. An exclusive advisory lock on `{file}.lock` is
/// held for the lifetime of the backend so two relays cannot share a file.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    _lock: File,
}

impl JsonFileBackend {
    /// Open (or prepare) the sessions file at `path` and take the instance lock.
    pub fn open(path: impl Into<PathBuf>) -> std::result::Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .context(format!("creating session directory {}", parent.display()))
                .map_err(StoreError::Persistence)?;
        }

        let lock_path = sibling(&path, "", ".lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .context(format!("opening lock file {}", lock_path.display()))
            .map_err(StoreError::Persistence)?;

        lock.try_lock_exclusive().map_err(|_| StoreError::Locked {
            path: path.display().to_string(),
        })?;

        Ok(Self { path, _lock: lock })
    }

    /// Path of the sessions file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, ".", ".tmp")
    }
}

impl SessionBackend for JsonFileBackend {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<Option<SessionMap>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .context(format!("reading {}", self.path.display()))?;

        if content.trim().is_empty() {
            tracing::warn!(
                path = %self.path.display(),
                bytes = content.len(),
                "Sessions file is blank; treating it as holding no sessions"
            );
            return Ok(None);
        }

        let sessions: SessionMap = serde_json::from_str(&content)
            .context(format!("parsing {}", self.path.display()))?;

        Ok(Some(sessions))
    }

    fn save(&self, sessions: &SessionMap) -> Result<()> {
        let json = serde_json::to_string_pretty(sessions)?;

        let tmp_path = self.temp_path();
        let mut tmp = File::create(&tmp_path)
            .context(format!("creating {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())
            .context(format!("writing {}", tmp_path.display()))?;
        tmp.sync_all()
            .context(format!("syncing {}", tmp_path.display()))?;
        drop(tmp);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io(e).with_context(format!("replacing {}", self.path.display())));
        }

        sync_parent_dir(&self.path);

        Ok(())
    }

    fn quarantine(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let target = sibling(&self.path, "", &format!(".corrupt-{stamp}"));
        fs::rename(&self.path, &target).context(format!(
            "moving {} to {}",
            self.path.display(),
            target.display()
        ))?;

        Ok(Some(target))
    }
}

/// Make a rename inside the parent directory durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// `dir/{prefix}{file_name}{suffix}` next to `path`.
fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sessions.json".to_string());
    path.with_file_name(format!("{prefix}{name}{suffix}"))
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Backend that keeps the "persisted" map in memory.
///
/// Used for ephemeral runs and tests; writes can be made to fail to simulate
/// a full or read-only disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    persisted: Mutex<Option<SessionMap>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `sessions` already persisted.
    pub fn with_sessions(sessions: SessionMap) -> Self {
        Self {
            persisted: Mutex::new(Some(sessions)),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// What a restart would load.
    pub fn persisted(&self) -> SessionMap {
        self.persisted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }
}

impl SessionBackend for MemoryBackend {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn load(&self) -> Result<Option<SessionMap>> {
        Ok(self
            .persisted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, sessions: &SessionMap) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("no space left on device")));
        }
        *self
            .persisted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sessions.clone());
        Ok(())
    }

    fn quarantine(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .persisted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .map(|_| PathBuf::from("memory")))
    }
}
