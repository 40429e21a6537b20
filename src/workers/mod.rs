//! Worker processes and their supervision
//!
//! Each worker is a separate OS process (spawned from this same binary via
//! the hidden `worker <kind>` subcommand) serving its RPC frame on a
//! localhost port. A worker publishes `http://127.0.0.1:<port>/<secret>/`
//! in `workers/<kind>.url` (mode 0600) so local peers and the CLI can
//! reach it; the app worker spawns and supervises the others, restarting
//! them with backoff when they die.

pub mod app;
pub mod openpgp;
pub mod recovery;
pub mod smtp_bridge;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{ApiError, AppResult};
use crate::rpc::client::RpcClient;

/// Worker kinds the supervisor knows how to launch
pub const PEER_WORKERS: [&str; 3] = ["openpgp", "recovery", "smtp_bridge"];

/// Delay before restarting a crashed worker (doubles up to the cap)
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// The `workers/` state directory under a profile
pub fn worker_dir(profile_dir: &Path) -> AppResult<PathBuf> {
    let dir = profile_dir.join("workers");
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// Bind a localhost listener; port 0 asks the kernel for a free one
pub async fn bind_localhost(port: u16) -> AppResult<(TcpListener, u16)> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let bound = listener.local_addr()?.port();
    Ok((listener, bound))
}

/// Publish a worker's URL (including secret) and PID for local peers
pub fn publish_worker(
    profile_dir: &Path,
    kind: &str,
    port: u16,
    secret: &str,
) -> AppResult<String> {
    let dir = worker_dir(profile_dir)?;
    let url = format!("http://127.0.0.1:{port}/{secret}/");

    let url_path = dir.join(format!("{kind}.url"));
    std::fs::write(&url_path, &url)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&url_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::write(dir.join(format!("{kind}.pid")), std::process::id().to_string())?;
    info!(kind, url = %redact_url(&url), "worker published");
    Ok(url)
}

/// Read a published worker URL, if the worker has announced itself
pub fn read_worker_url(profile_dir: &Path, kind: &str) -> AppResult<Option<String>> {
    let path = worker_dir(profile_dir)?.join(format!("{kind}.url"));
    match std::fs::read_to_string(&path) {
        Ok(url) => Ok(Some(url.trim().to_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Remove a worker's published files on clean shutdown
pub fn unpublish_worker(profile_dir: &Path, kind: &str) {
    if let Ok(dir) = worker_dir(profile_dir) {
        let _ = std::fs::remove_file(dir.join(format!("{kind}.url")));
        let _ = std::fs::remove_file(dir.join(format!("{kind}.pid")));
    }
}

/// URL with the secret segment masked, for logs
fn redact_url(url: &str) -> String {
    match url.rsplitn(3, '/').collect::<Vec<_>>().as_slice() {
        // http://host:port/SECRET/ splits as ["", "SECRET", "http://host:port"]
        [_, _, head] => format!("{head}/…/"),
        _ => url.to_owned(),
    }
}

/// Client for a published worker
pub async fn worker_client(profile_dir: &Path, kind: &str) -> AppResult<RpcClient> {
    let url = read_worker_url(profile_dir, kind)?
        .ok_or_else(|| ApiError::NotFound(format!("worker '{kind}' is not running")))?;
    Ok(RpcClient::new(&url))
}

/// Ask a worker to exit, tolerating one that is already gone
pub async fn stop_worker(profile_dir: &Path, kind: &str) -> AppResult<bool> {
    match worker_client(profile_dir, kind).await {
        Ok(client) => {
            let stopped = client.call("quit", &serde_json::Value::Null).await.is_ok();
            unpublish_worker(profile_dir, kind);
            Ok(stopped)
        }
        Err(ApiError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Spawns peer worker processes and keeps them alive
pub struct Supervisor {
    profile_dir: PathBuf,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(profile_dir: &Path) -> Self {
        Self {
            profile_dir: profile_dir.to_owned(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token peers can use to observe supervisor shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch one worker kind and keep restarting it until shutdown
    pub fn supervise(&self, kind: &'static str) {
        let profile_dir = self.profile_dir.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut backoff = RESTART_BACKOFF;
            loop {
                let exe = match std::env::current_exe() {
                    Ok(exe) => exe,
                    Err(err) => {
                        warn!(error = %err, "cannot locate own executable");
                        return;
                    }
                };
                let child = tokio::process::Command::new(exe)
                    .arg("worker")
                    .arg(kind)
                    .arg("--work-dir")
                    .arg(&profile_dir)
                    .kill_on_drop(true)
                    .spawn();
                let mut child = match child {
                    Ok(child) => {
                        info!(kind, "worker process spawned");
                        child
                    }
                    Err(err) => {
                        warn!(kind, error = %err, "worker spawn failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                        continue;
                    }
                };

                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) if status.success() => {
                                info!(kind, "worker exited cleanly");
                                return;
                            }
                            Ok(status) => {
                                warn!(kind, %status, "worker died, restarting");
                            }
                            Err(err) => {
                                warn!(kind, error = %err, "worker wait failed");
                            }
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                    }
                    () = shutdown.cancelled() => {
                        let _ = stop_worker(&profile_dir, kind).await;
                        let _ = child.kill().await;
                        return;
                    }
                }
            }
        });
    }

    /// Stop every supervised worker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{publish_worker, read_worker_url, redact_url, unpublish_worker};

    fn temp_profile(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-workers-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("temp dir created");
        dir
    }

    #[test]
    fn publish_and_read_worker_url() {
        let dir = temp_profile("publish");
        let url = publish_worker(&dir, "app", 8025, "SECRET").expect("publish succeeds");
        assert_eq!(url, "http://127.0.0.1:8025/SECRET/");
        assert_eq!(
            read_worker_url(&dir, "app").expect("read succeeds"),
            Some(url)
        );
        assert_eq!(read_worker_url(&dir, "absent").expect("read succeeds"), None);

        unpublish_worker(&dir, "app");
        assert_eq!(read_worker_url(&dir, "app").expect("read succeeds"), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn published_url_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = temp_profile("perms");
        publish_worker(&dir, "app", 1, "S").expect("publish succeeds");
        let mode = std::fs::metadata(dir.join("workers").join("app.url"))
            .expect("file exists")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn secrets_never_reach_logs() {
        assert_eq!(
            redact_url("http://127.0.0.1:8025/VERYSECRET/"),
            "http://127.0.0.1:8025/…/"
        );
    }
}
