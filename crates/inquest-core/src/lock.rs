//! Leased run lock with heartbeat and stale takeover.
//!
//! The lock file is `<run_root>/.lock` and contains JSON metadata about
//! the holder. Owners are identified by `hostname:pid:created_at`; a
//! heartbeat refreshes `refreshed_at`, and a lock whose lease has
//! elapsed since the last refresh may be taken over by unlinking and
//! re-creating with `O_EXCL`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};
use crate::schema::policy::RunLockPolicy;

/// Contents of the `.lock` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub lease_seconds: u64,
    pub refreshed_at: DateTime<Utc>,
    /// `hostname:pid:created_at` of the holder.
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LockInfo {
    /// Whether the lease has elapsed since the last refresh.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now > self.refreshed_at + chrono::Duration::seconds(self.lease_seconds as i64)
    }
}

/// A held run lock. Release is explicit; drop is deliberately not a
/// release so a crashed holder leaves a lease for takeover accounting.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner_id: String,
}

impl RunLock {
    /// Acquire the lock for `run_root`.
    ///
    /// A live lock → `LOCK_HELD`. A stale lock is taken over by unlink
    /// followed by an exclusive create; losing that race once more is
    /// reported as `LOCK_HELD`.
    pub fn acquire(run_root: &Path, policy: &RunLockPolicy, reason: Option<&str>) -> Result<Self> {
        let path = run_root.join(".lock");
        let now = Utc::now();

        if let Some(existing) = try_read(&path)? {
            if existing.is_stale_at(now) {
                tracing::warn!(
                    event = "lock.stale_takeover",
                    path = %path.display(),
                    prior_owner = %existing.owner_id,
                );
                // Unlink then re-create exclusively; a concurrent
                // acquirer may win the create.
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(CoreError::new(
                            ErrorCode::LockWriteFailed,
                            format!("failed to unlink stale lock: {e}"),
                        ))
                    }
                }
            } else {
                return Err(CoreError::new(
                    ErrorCode::LockHeld,
                    format!(
                        "lock held by {} since {}",
                        existing.owner_id, existing.refreshed_at
                    ),
                )
                .with_details(serde_json::json!({ "owner_id": existing.owner_id })));
            }
        }

        let pid = std::process::id();
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let owner_id = format!("{hostname}:{pid}:{}", now.to_rfc3339());
        let info = LockInfo {
            pid,
            hostname,
            created_at: now,
            lease_seconds: policy.lease_seconds,
            refreshed_at: now,
            owner_id: owner_id.clone(),
            reason: reason.map(String::from),
        };

        write_exclusive(&path, &info)?;
        Ok(Self { path, owner_id })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Refresh the lease. Requires the on-disk owner to still be us.
    pub fn refresh(&self) -> Result<()> {
        let mut info = read_owned(&self.path, &self.owner_id)?;
        info.refreshed_at = Utc::now();
        overwrite(&self.path, &info)
    }

    /// Release the lock. Requires ownership.
    pub fn release(self) -> Result<()> {
        read_owned(&self.path, &self.owner_id)?;
        fs::remove_file(&self.path).map_err(|e| {
            CoreError::new(
                ErrorCode::LockReleaseFailed,
                format!("failed to remove lock {}: {e}", self.path.display()),
            )
        })
    }

    /// Read the current lock file for a run root, if present.
    pub fn inspect(run_root: &Path) -> Result<Option<LockInfo>> {
        try_read(&run_root.join(".lock"))
    }
}

fn try_read(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CoreError::new(
                ErrorCode::LockReadFailed,
                format!("failed to read lock {}: {e}", path.display()),
            ))
        }
    };
    let info: LockInfo = serde_json::from_str(&content).map_err(|e| {
        CoreError::new(
            ErrorCode::LockReadFailed,
            format!("failed to parse lock {}: {e}", path.display()),
        )
    })?;
    Ok(Some(info))
}

fn read_owned(path: &Path, owner_id: &str) -> Result<LockInfo> {
    let info = try_read(path)?.ok_or_else(|| {
        CoreError::new(ErrorCode::LockNotHeld, format!("no lock at {}", path.display()))
    })?;
    if info.owner_id != owner_id {
        return Err(CoreError::new(
            ErrorCode::LockNotOwned,
            format!("lock owned by {}, not {owner_id}", info.owner_id),
        ));
    }
    Ok(info)
}

fn write_exclusive(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).map_err(|e| {
        CoreError::new(ErrorCode::LockWriteFailed, format!("serialize lock: {e}"))
    })?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CoreError::new(ErrorCode::LockHeld, "lock re-created by a concurrent acquirer")
            } else {
                CoreError::new(
                    ErrorCode::LockWriteFailed,
                    format!("failed to create lock {}: {e}", path.display()),
                )
            }
        })?;
    file.write_all(json.as_bytes()).map_err(|e| {
        CoreError::new(ErrorCode::LockWriteFailed, format!("failed to write lock: {e}"))
    })
}

fn overwrite(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).map_err(|e| {
        CoreError::new(ErrorCode::LockWriteFailed, format!("serialize lock: {e}"))
    })?;
    fs::write(path, json).map_err(|e| {
        CoreError::new(
            ErrorCode::LockWriteFailed,
            format!("failed to refresh lock {}: {e}", path.display()),
        )
    })
}

/// Best-effort lease refresher running on the runtime.
///
/// Aborts on drop. Consecutive refresh failures beyond the policy cap
/// stop the heartbeat; the tick then fails naturally at release time.
pub struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(run_root: &Path, owner_id: &str, policy: &RunLockPolicy) -> Self {
        let path = run_root.join(".lock");
        let owner = owner_id.to_string();
        let interval = std::time::Duration::from_millis(policy.heartbeat_interval_ms);
        let max_failures = policy.heartbeat_max_failures;

        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the initial
            // acquire timestamp stands.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = read_owned(&path, &owner).and_then(|mut info| {
                    info.refreshed_at = Utc::now();
                    overwrite(&path, &info)
                });
                match result {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        tracing::warn!(
                            event = "lock.heartbeat_failed",
                            error = %err,
                            failures = failures,
                        );
                        if failures >= max_failures {
                            break;
                        }
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn policy() -> RunLockPolicy {
        RunLockPolicy::default()
    }

    #[test]
    fn test_acquire_writes_lock_file() {
        let dir = tempdir().expect("tempdir");
        let lock = RunLock::acquire(dir.path(), &policy(), Some("tick")).expect("acquire");

        let info = RunLock::inspect(dir.path()).expect("inspect").expect("present");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.owner_id, lock.owner_id());
        assert_eq!(info.reason.as_deref(), Some("tick"));

        lock.release().expect("release");
        assert!(RunLock::inspect(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_second_acquire_is_lock_held() {
        let dir = tempdir().expect("tempdir");
        let _lock = RunLock::acquire(dir.path(), &policy(), None).expect("acquire");
        let err = RunLock::acquire(dir.path(), &policy(), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::LockHeld);
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let dir = tempdir().expect("tempdir");
        let stale = LockInfo {
            pid: 1,
            hostname: "elsewhere".into(),
            created_at: Utc::now() - chrono::Duration::hours(1),
            lease_seconds: 60,
            refreshed_at: Utc::now() - chrono::Duration::hours(1),
            owner_id: "elsewhere:1:old".into(),
            reason: None,
        };
        fs::write(
            dir.path().join(".lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = RunLock::acquire(dir.path(), &policy(), None).expect("takeover");
        let info = RunLock::inspect(dir.path()).unwrap().unwrap();
        assert_eq!(info.owner_id, lock.owner_id());
        assert_ne!(info.owner_id, "elsewhere:1:old");
    }

    #[test]
    fn test_refresh_advances_lease() {
        let dir = tempdir().expect("tempdir");
        let lock = RunLock::acquire(dir.path(), &policy(), None).expect("acquire");
        let before = RunLock::inspect(dir.path()).unwrap().unwrap().refreshed_at;
        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.refresh().expect("refresh");
        let after = RunLock::inspect(dir.path()).unwrap().unwrap().refreshed_at;
        assert!(after > before);
    }

    #[test]
    fn test_release_of_usurped_lock_is_not_owned() {
        let dir = tempdir().expect("tempdir");
        let lock = RunLock::acquire(dir.path(), &policy(), None).expect("acquire");

        // Simulate another process overwriting the lock.
        let mut info = RunLock::inspect(dir.path()).unwrap().unwrap();
        info.owner_id = "intruder:9:now".into();
        fs::write(dir.path().join(".lock"), serde_json::to_string(&info).unwrap()).unwrap();

        let err = lock.release().unwrap_err();
        assert_eq!(err.code, ErrorCode::LockNotOwned);
    }

    #[test]
    fn test_release_when_absent_is_not_held() {
        let dir = tempdir().expect("tempdir");
        let lock = RunLock::acquire(dir.path(), &policy(), None).expect("acquire");
        fs::remove_file(dir.path().join(".lock")).unwrap();
        let err = lock.release().unwrap_err();
        assert_eq!(err.code, ErrorCode::LockNotHeld);
    }

    #[test]
    fn test_staleness_boundary() {
        let now = Utc::now();
        let info = LockInfo {
            pid: 1,
            hostname: "h".into(),
            created_at: now,
            lease_seconds: 60,
            refreshed_at: now,
            owner_id: "h:1:x".into(),
            reason: None,
        };
        assert!(!info.is_stale_at(now + chrono::Duration::seconds(59)));
        assert!(info.is_stale_at(now + chrono::Duration::seconds(61)));
    }
}
