//! The out-of-band stop flag.
//!
//! A worker named `w` owns `w.json`, holding `{"stop_flag": <bool>}` beside
//! the advisory lock file `w.json.lock`. A separate `stop` invocation, on any
//! machine sharing the filesystem, flips the flag under the lock; a watcher
//! task inside the worker polls it and cancels the shutdown token, so an
//! in-flight job takes the failure path before the process exits.

use anyhow::Context;
use exponential_backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lock acquisition retries, with base-2 exponential backoff.
const LOCK_RETRIES: u32 = 3;
const LOCK_BACKOFF_MIN: Duration = Duration::from_secs(2);
const LOCK_BACKOFF_MAX: Duration = Duration::from_secs(8);
/// Cadence of the in-worker flag watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct FlagFile {
    stop_flag: bool,
}

fn flag_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{name}.json"))
}

fn lock_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{name}.json.lock"))
}

/// Advisory lock over the flag file, held while reading or writing it.
/// Dropping releases the lock.
struct FlagLock {
    path: PathBuf,
}

impl FlagLock {
    fn acquire(name: &str) -> anyhow::Result<Self> {
        let path = lock_path(name);
        let backoff = Backoff::new(LOCK_RETRIES, LOCK_BACKOFF_MIN, Some(LOCK_BACKOFF_MAX));
        let mut attempt = 0;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    attempt += 1;
                    let Some(delay) = backoff.next(attempt) else {
                        anyhow::bail!("failed to lock flag file {}", path.display());
                    };
                    tracing::warn!(attempt, path = %path.display(), "flag file is locked, retrying");
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("creating lock file {}", path.display()))
                }
            }
        }
    }
}

impl Drop for FlagLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release flag file lock");
        }
    }
}

fn write_flag(name: &str, stop_flag: bool) -> anyhow::Result<()> {
    let path = flag_path(name);
    let body = serde_json::to_string(&FlagFile { stop_flag })?;
    std::fs::write(&path, body + "\n")
        .with_context(|| format!("writing flag file {}", path.display()))?;
    Ok(())
}

/// Create the flag file at worker start. An existing file is an error unless
/// `force` is set.
pub fn create_flag_file(name: &str, force: bool) -> anyhow::Result<()> {
    let path = flag_path(name);
    if path.exists() {
        if !force {
            anyhow::bail!(
                "flag file {} already exists; is another worker running under this name?",
                path.display()
            );
        }
        tracing::warn!(path = %path.display(), "flag file already exists, overwriting");
    }
    write_flag(name, false)
}

/// Read the current flag under the advisory lock.
pub fn is_stop_flag_set(name: &str) -> anyhow::Result<bool> {
    let _lock = FlagLock::acquire(name)?;
    let path = flag_path(name);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading flag file {}", path.display()))?;
    let flag: FlagFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing flag file {}", path.display()))?;
    Ok(flag.stop_flag)
}

/// Request a graceful stop of the worker named `name`.
pub fn set_stop_flag(name: &str) -> anyhow::Result<()> {
    let path = flag_path(name);
    anyhow::ensure!(
        path.exists(),
        "flag file {} does not exist; is the worker running?",
        path.display()
    );
    let _lock = FlagLock::acquire(name)?;
    write_flag(name, true)
}

/// Remove the flag file on clean exit. Refuses unless the flag was set, so a
/// worker killed some other way keeps its file for inspection.
pub fn delete_flag_file(name: &str) -> anyhow::Result<()> {
    let _lock = FlagLock::acquire(name)?;
    let path = flag_path(name);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading flag file {}", path.display()))?;
    let flag: FlagFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing flag file {}", path.display()))?;
    anyhow::ensure!(
        flag.stop_flag,
        "refusing to delete {}: its stop flag is not set",
        path.display()
    );
    std::fs::remove_file(&path)
        .with_context(|| format!("deleting flag file {}", path.display()))?;
    Ok(())
}

/// Watch the stop flag and cancel `token` once it is set. Exits when the
/// token is cancelled by anyone.
pub fn spawn_stop_flag_watcher(name: String, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if token.is_cancelled() {
                return;
            }
            let flag_name = name.clone();
            match tokio::task::spawn_blocking(move || is_stop_flag_set(&flag_name)).await {
                Ok(Ok(true)) => {
                    tracing::info!("stop flag is set, shutting down");
                    token.cancel();
                    return;
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(?err, "failed to read the stop flag")
                }
                Err(err) => tracing::warn!(error = %err, "stop flag watcher task failed"),
            }
            tokio::time::sleep(WATCH_INTERVAL).await;
        }
    });
}
