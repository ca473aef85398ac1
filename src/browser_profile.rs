//! Chrome profile directory management
//!
//! Ephemeral sessions get a uuid-named temp directory removed on disconnect;
//! named profiles persist under the local data dir. SingletonLock conflicts
//! from crashed browsers are detected and cleaned before they can poison a
//! launch.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EPHEMERAL_PREFIX: &str = "tabmux_profile_";
const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Ephemeral profile directory with cleanup-on-drop.
///
/// Call [`into_path`](Self::into_path) to transfer ownership to the session,
/// which removes the directory during disconnect instead.
#[derive(Debug)]
pub struct BrowserProfile {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl BrowserProfile {
    fn new(path: PathBuf) -> Self {
        Self { path, cleanup_on_drop: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume and return the path, disabling drop cleanup.
    pub fn into_path(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BrowserProfile {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove profile directory");
            }
        }
    }
}

/// Create a fresh uuid-named ephemeral profile directory under temp.
///
/// `create_dir` (not `create_dir_all`) keeps creation atomic; an existing
/// directory means a uuid collision and fails loudly.
pub fn create_ephemeral_profile() -> Result<BrowserProfile> {
    let path = std::env::temp_dir().join(format!("{EPHEMERAL_PREFIX}{}", Uuid::new_v4()));
    std::fs::create_dir(&path)
        .with_context(|| format!("failed to create profile directory {}", path.display()))?;
    debug!(path = %path.display(), "created ephemeral profile");
    Ok(BrowserProfile::new(path))
}

/// Resolve (and create if needed) the directory for a named persistent
/// profile.
pub fn persistent_profile_dir(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        anyhow::bail!("invalid profile name '{name}'");
    }
    let base = dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tabmux")
        .join("profiles");
    let path = base.join(name);
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create profile directory {}", path.display()))?;
    Ok(path)
}

/// Recursive delete with bounded retries.
///
/// Chrome may still hold files open for a moment after process exit; a
/// short retry loop absorbs that window. The last error is returned when
/// all attempts fail.
pub async fn remove_profile_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut last_err = None;
    for attempt in 1..=REMOVE_ATTEMPTS {
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                info!(path = %path.display(), "removed profile directory");
                return Ok(());
            }
            Err(e) => {
                debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "profile directory removal failed, retrying"
                );
                last_err = Some(e);
                tokio::time::sleep(REMOVE_RETRY_DELAY).await;
            }
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("profile removal failed")))
    .with_context(|| format!("failed to remove profile directory {}", path.display()))
}

/// Check whether a profile's SingletonLock belongs to a dead process.
///
/// The lock is a symlink targeting `{hostname}-{pid}`; the pid is checked
/// against the live process table.
pub fn is_singleton_lock_stale(profile_dir: &Path) -> bool {
    let lock_path = profile_dir.join("SingletonLock");
    if !lock_path.exists() && !lock_path.is_symlink() {
        return true;
    }

    match std::fs::read_link(&lock_path) {
        Ok(target) => {
            let target_str = target.to_string_lossy();
            let Some(pid) = target_str.rsplit('-').next().and_then(|p| p.parse::<u32>().ok())
            else {
                warn!(target = %target_str, "could not parse pid from SingletonLock");
                return false;
            };
            let pid = sysinfo::Pid::from_u32(pid);
            let mut system = sysinfo::System::new();
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), false);
            let alive = system.process(pid).is_some();
            if !alive {
                info!(pid = pid.as_u32(), "SingletonLock is stale");
            }
            !alive
        }
        Err(e) => {
            debug!(error = %e, "SingletonLock is not a readable symlink");
            // A plain file there means a corrupted lock; treat as stale.
            lock_path.is_file()
        }
    }
}

/// Remove a stale SingletonLock. Only call after
/// [`is_singleton_lock_stale`] returned true.
pub fn cleanup_stale_lock(profile_dir: &Path) -> Result<()> {
    let lock_path = profile_dir.join("SingletonLock");
    if lock_path.exists() || lock_path.is_symlink() {
        info!(path = %lock_path.display(), "removing stale SingletonLock");
        std::fs::remove_file(&lock_path)
            .with_context(|| format!("failed to remove {}", lock_path.display()))?;
    }
    Ok(())
}

/// Startup maintenance: delete orphaned ephemeral profiles left by crashes.
pub fn cleanup_stale_profiles() -> Result<usize> {
    let temp_dir = std::env::temp_dir();
    let mut cleaned = 0;

    let entries = std::fs::read_dir(&temp_dir)
        .with_context(|| format!("failed to read temp directory {}", temp_dir.display()))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(EPHEMERAL_PREFIX)
            && path.is_dir()
            && is_singleton_lock_stale(&path)
        {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale profile");
            } else {
                cleaned += 1;
            }
        }
    }

    if cleaned > 0 {
        info!(cleaned, "removed stale ephemeral profiles");
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_profile_cleans_up_on_drop() {
        let profile = create_ephemeral_profile().expect("profile should create");
        let path = profile.path().to_path_buf();
        assert!(path.exists());
        drop(profile);
        assert!(!path.exists());
    }

    #[test]
    fn into_path_disables_cleanup() {
        let profile = create_ephemeral_profile().expect("profile should create");
        let path = profile.into_path();
        assert!(path.exists());
        std::fs::remove_dir_all(&path).expect("manual cleanup should work");
    }

    #[tokio::test]
    async fn remove_profile_dir_is_idempotent() {
        let profile = create_ephemeral_profile().expect("profile should create");
        let path = profile.into_path();
        remove_profile_dir(&path).await.expect("first removal should work");
        remove_profile_dir(&path).await.expect("second removal is a no-op");
    }

    #[test]
    fn missing_lock_is_stale() {
        let profile = create_ephemeral_profile().expect("profile should create");
        assert!(is_singleton_lock_stale(profile.path()));
    }

    #[test]
    fn invalid_profile_names_are_rejected() {
        assert!(persistent_profile_dir("").is_err());
        assert!(persistent_profile_dir("a/b").is_err());
    }
}
