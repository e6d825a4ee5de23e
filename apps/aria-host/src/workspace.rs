//! Workspace singleton lock and discovery metadata.
//!
//! One host per workspace: the lock file records who owns it, the discovery
//! file tells clients where to connect and carries the heartbeat that lets
//! a successor detect a crashed owner.
//!
//! # File layout
//!
//! ```text
//! {workspace}/.aria/
//!   aria-bridge.lock     # {pid, startedAt, workspacePath}
//!   aria-bridge.json     # discovery metadata, heartbeatAt rewritten every 5 s
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aria_protocol::{DISCOVERY_HEARTBEAT_MS, SESSION_STALE_MS};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ARIA_DIR: &str = ".aria";
pub const LOCK_FILE: &str = "aria-bridge.lock";
pub const DISCOVERY_FILE: &str = "aria-bridge.json";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("another host (pid {pid}) is already running for this workspace; lock: {path}")]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workspace metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileBody {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub workspace_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMetadata {
    pub url: String,
    pub port: u16,
    pub secret: String,
    pub workspace_path: String,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub heartbeat_at: DateTime<Utc>,
}

/// Paths under one workspace root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn aria_dir(&self) -> PathBuf {
        self.root.join(ARIA_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.aria_dir().join(LOCK_FILE)
    }

    pub fn discovery_path(&self) -> PathBuf {
        self.aria_dir().join(DISCOVERY_FILE)
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Held for the lifetime of the host; releases the lock on `release()`.
#[derive(Debug)]
pub struct WorkspaceLock {
    paths: WorkspacePaths,
    started_at: DateTime<Utc>,
}

impl WorkspaceLock {
    /// Take ownership of the workspace or fail because a live host holds it.
    ///
    /// A previous owner is considered gone when its pid is not signalable or
    /// its discovery heartbeat is older than the staleness threshold.
    pub fn acquire(paths: WorkspacePaths) -> Result<Self, WorkspaceError> {
        fs::create_dir_all(paths.aria_dir())?;

        let lock_path = paths.lock_path();
        if let Ok(raw) = fs::read_to_string(&lock_path) {
            if let Ok(body) = serde_json::from_str::<LockFileBody>(&raw) {
                let alive = pid_alive(body.pid);
                let stale = discovery_heartbeat_stale(&paths);
                if alive && !stale {
                    return Err(WorkspaceError::AlreadyRunning {
                        pid: body.pid,
                        path: lock_path,
                    });
                }
                info!(
                    pid = body.pid,
                    alive, stale, "Stale lock detected, taking over workspace"
                );
            }
            let _ = fs::remove_file(&lock_path);
        }

        let started_at = Utc::now();
        let body = LockFileBody {
            pid: std::process::id(),
            started_at,
            workspace_path: paths.root().to_string_lossy().into_owned(),
        };
        write_atomic(&lock_path, &serde_json::to_vec_pretty(&body)?)?;
        Ok(Self { paths, started_at })
    }

    /// Write the discovery file clients read to find this host.
    pub fn publish(&self, port: u16, secret: &str) -> Result<DiscoveryMetadata, WorkspaceError> {
        let meta = DiscoveryMetadata {
            url: format!("ws://127.0.0.1:{port}"),
            port,
            secret: secret.to_string(),
            workspace_path: self.paths.root().to_string_lossy().into_owned(),
            started_at: self.started_at,
            pid: std::process::id(),
            heartbeat_at: Utc::now(),
        };
        write_atomic(
            &self.paths.discovery_path(),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(meta)
    }

    /// Refresh `heartbeatAt`. Errors are the caller's to log; a later tick
    /// may succeed.
    pub fn heartbeat(&self) -> Result<(), WorkspaceError> {
        let raw = fs::read_to_string(self.paths.discovery_path())?;
        let mut meta: DiscoveryMetadata = serde_json::from_str(&raw)?;
        meta.heartbeat_at = Utc::now();
        write_atomic(
            &self.paths.discovery_path(),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(())
    }

    /// Orderly shutdown: drop the lock. The discovery file stays so the next
    /// host can reuse the secret.
    pub fn release(&self) {
        if let Err(err) = fs::remove_file(self.paths.lock_path()) {
            warn!(%err, "failed to remove workspace lock");
        }
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }
}

/// Spawn the 5 s heartbeat loop. Tick failures are logged and skipped.
pub fn spawn_heartbeat(lock: std::sync::Arc<WorkspaceLock>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(DISCOVERY_HEARTBEAT_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = lock.heartbeat() {
                warn!(%err, "discovery heartbeat failed");
            }
        }
    })
}

fn discovery_heartbeat_stale(paths: &WorkspacePaths) -> bool {
    let Ok(raw) = fs::read_to_string(paths.discovery_path()) else {
        // No discovery file: nothing proves liveness beyond the pid probe.
        return false;
    };
    let Ok(meta) = serde_json::from_str::<DiscoveryMetadata>(&raw) else {
        return true;
    };
    let age = Utc::now().signed_duration_since(meta.heartbeat_at);
    age.num_milliseconds() > SESSION_STALE_MS as i64
}

/// Secret priority: explicit env override, then whatever the previous host
/// published, then a freshly minted 256-bit hex secret.
pub fn resolve_secret(paths: &WorkspacePaths) -> String {
    for var in ["ARIA_BRIDGE_HOST_SECRET", "ARIA_BRIDGE_SECRET"] {
        if let Ok(secret) = std::env::var(var) {
            if !secret.is_empty() {
                return secret;
            }
        }
    }
    if let Ok(raw) = fs::read_to_string(paths.discovery_path()) {
        if let Ok(meta) = serde_json::from_str::<DiscoveryMetadata>(&raw) {
            if !meta.secret.is_empty() {
                return meta.secret;
            }
        }
    }
    mint_secret()
}

fn mint_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Bind the preferred port, or the next free one in a short scan.
pub async fn bind_port(preferred: u16) -> std::io::Result<(tokio::net::TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..16u16 {
        let port = preferred.saturating_add(offset);
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free port in range")
    }))
}

/// Write-then-rename so readers never observe a half-written file.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
