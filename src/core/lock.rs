//! Advisory run lock: one marker file per state directory, created atomically,
//! with dead-owner detection and age-based reclamation.
//!
//! Taking over a stale marker happens under a second `create_new` guard file,
//! and only if the marker still holds the bytes that were judged stale.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::platform::{NativePlatform, Platform};

pub const LOCK_FILE: &str = "run.lock";
pub const RECLAIM_GUARD: &str = "run.lock.reclaim";

/// A reclaim guard is held for a few file operations; one this old was
/// left by a process that died mid-reclaim.
const ABANDONED_GUARD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub owner_pid: u32,
    pub owner_host: String,
    pub run_id: String,
    /// Unix seconds.
    pub created_at: u64,
}

impl LockOwner {
    fn current(run_id: &str) -> Self {
        Self {
            owner_pid: std::process::id(),
            owner_host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            run_id: run_id.to_string(),
            created_at: unix_now(),
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.created_at))
    }

    pub fn is_alive(&self) -> bool {
        NativePlatform::is_process_alive(self.owner_pid)
    }

    /// Dead owner and older than the threshold.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        !self.is_alive() && self.age() > stale_after
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockHandle),
    Busy(LockOwner),
}

/// Held lock. Released explicitly or on drop; release is idempotent.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    owner: LockOwner,
    reclaimed_from: Option<LockOwner>,
    released: bool,
}

impl LockHandle {
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Previous owner when a stale lock was taken over.
    pub fn reclaimed_from(&self) -> Option<&LockOwner> {
        self.reclaimed_from.as_ref()
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match read_owner(&self.path) {
            Ok(Some(current)) if current == self.owner => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to remove lock {}: {}", self.path.display(), e);
                } else {
                    info!(run_id = %self.owner.run_id, "Run lock released");
                }
            }
            Ok(Some(other)) => {
                warn!(
                    "Lock {} now belongs to run {} (pid {}); leaving it",
                    self.path.display(),
                    other.run_id,
                    other.owner_pid
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Could not inspect lock {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Raw marker bytes plus the owner they describe.
fn read_marker(path: &Path) -> Result<Option<(String, LockOwner)>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let owner = match serde_json::from_str::<LockOwner>(&text) {
        Ok(owner) => owner,
        Err(_) => {
            // Unreadable marker: unknown owner, aged by mtime.
            let created_at = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            LockOwner {
                owner_pid: 0,
                owner_host: "unknown".to_string(),
                run_id: "unknown".to_string(),
                created_at,
            }
        }
    };
    Ok(Some((text, owner)))
}

fn read_owner(path: &Path) -> Result<Option<LockOwner>> {
    Ok(read_marker(path)?.map(|(_, owner)| owner))
}

/// Exclusive right to replace a stale marker. Removed on drop.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn take(state_dir: &Path, owner: &LockOwner) -> Result<Option<Self>> {
        let path = state_dir.join(RECLAIM_GUARD);
        if try_create(&path, owner)? {
            return Ok(Some(Self { path }));
        }
        let abandoned = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > ABANDONED_GUARD);
        if abandoned {
            warn!("Removing abandoned reclaim guard {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
        Ok(None)
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

pub struct RunLock;

impl RunLock {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(LOCK_FILE)
    }

    /// Current holder, if any.
    pub fn inspect(state_dir: &Path) -> Result<Option<LockOwner>> {
        read_owner(&Self::path(state_dir))
    }

    pub fn acquire(state_dir: &Path, run_id: &str, stale_after: Duration) -> Result<LockAcquisition> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("cannot create {}", state_dir.display()))?;
        let path = Self::path(state_dir);
        let owner = LockOwner::current(run_id);

        if try_create(&path, &owner)? {
            info!(run_id, "Run lock acquired");
            return Ok(LockAcquisition::Acquired(LockHandle {
                path,
                owner,
                reclaimed_from: None,
                released: false,
            }));
        }

        let Some((observed, existing)) = read_marker(&path)? else {
            // Released between our attempt and the read.
            return retry_once(path, owner, None);
        };

        if !existing.is_stale(stale_after) {
            return Ok(LockAcquisition::Busy(existing));
        }

        let Some(_guard) = ReclaimGuard::take(state_dir, &owner)? else {
            debug!("Another process is reclaiming the lock");
            return Ok(LockAcquisition::Busy(existing));
        };
        match read_marker(&path)? {
            Some((current, _)) if current == observed => {}
            Some((_, holder)) => return Ok(LockAcquisition::Busy(holder)),
            None => return retry_once(path, owner, None),
        }

        warn!(
            "Reclaiming stale lock held by dead pid {} (run {}, age {}s)",
            existing.owner_pid,
            existing.run_id,
            existing.age().as_secs()
        );
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("cannot remove {}", path.display())),
        }
        retry_once(path, owner, Some(existing))
    }
}

fn retry_once(
    path: PathBuf,
    owner: LockOwner,
    reclaimed_from: Option<LockOwner>,
) -> Result<LockAcquisition> {
    if try_create(&path, &owner)? {
        info!(run_id = %owner.run_id, "Run lock acquired");
        return Ok(LockAcquisition::Acquired(LockHandle {
            path,
            owner,
            reclaimed_from,
            released: false,
        }));
    }
    // Someone else won the race.
    let holder = read_owner(&path)?.unwrap_or(owner);
    Ok(LockAcquisition::Busy(holder))
}

fn try_create(path: &Path, owner: &LockOwner) -> Result<bool> {
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("cannot create {}", path.display())),
    };
    let body = serde_json::to_string(owner)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}
