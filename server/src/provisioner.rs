//! # Public Endpoint Provisioning
//!
//! Supplies the public base URL that registered tunnels are advertised
//! under. The server only reads the current base, if any, through
//! [`PublicEndpoint`].
//!
//! Two sources exist:
//! - [`StaticEndpoint`]: a base URL fixed in configuration.
//! - [`CloudflaredProvisioner`]: supervises a `cloudflared` quick tunnel
//!   and scrapes the `trycloudflare.com` URL it prints. The URL is cleared
//!   whenever the process exits and re-learned after the restart.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pattern of the URL cloudflared prints once its quick tunnel is up.
const QUICK_TUNNEL_URL: &str = r"https://[a-zA-Z0-9-]+\.trycloudflare\.com";

/// Wait after cloudflared failed to start at all.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Wait after cloudflared exited before starting it again.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Source of the public base URL used to build tunnel URLs.
pub trait PublicEndpoint: Send + Sync {
    /// The current base URL, or `None` while no public endpoint is available.
    fn current_public_base(&self) -> Option<String>;
}

/// A public base URL that never changes.
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    base: String,
}

impl StaticEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl PublicEndpoint for StaticEndpoint {
    fn current_public_base(&self) -> Option<String> {
        Some(self.base.clone())
    }
}

/// Keeps a cloudflared quick tunnel running and tracks its public URL.
pub struct CloudflaredProvisioner {
    program: String,
    /// Local origin cloudflared forwards to (this server's listener).
    origin: String,
    pattern: Regex,
    current: ArcSwapOption<String>,
}

impl CloudflaredProvisioner {
    pub fn new(program: impl Into<String>, origin: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            program: program.into(),
            origin: origin.into(),
            pattern: Regex::new(QUICK_TUNNEL_URL)?,
            current: ArcSwapOption::empty(),
        })
    }

    /// Start the supervision loop. It runs until `shutdown` flips to `true`
    /// or its sender is dropped, killing the child process on the way out.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise(shutdown).await })
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            info!(program = %self.program, origin = %self.origin, "starting cloudflared");
            let spawned = Command::new(&self.program)
                .args(["tunnel", "--url", &self.origin, "--no-autoupdate"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    warn!(program = %self.program, error = %e, "cloudflared failed to start");
                    if sleep_or_shutdown(SPAWN_RETRY_DELAY, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            // cloudflared prints its banner on stderr; scan both streams.
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(Arc::clone(&self).scan_output(stdout));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(Arc::clone(&self).scan_output(stderr));
            }

            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!(%status, "cloudflared exited"),
                        Err(e) => warn!(error = %e, "failed to wait on cloudflared"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("stopping cloudflared");
                    let _ = child.kill().await;
                    self.clear();
                    return;
                }
            }

            self.clear();

            if sleep_or_shutdown(RESTART_DELAY, &mut shutdown).await {
                return;
            }
        }
    }

    async fn scan_output<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "cloudflared", "{}", line);
            self.observe_line(&line);
        }
    }

    /// Record the quick-tunnel URL if `line` contains one.
    fn observe_line(&self, line: &str) {
        let Some(found) = self.pattern.find(line) else {
            return;
        };
        let url = found.as_str();
        let unchanged = self
            .current
            .load()
            .as_deref()
            .is_some_and(|current| current == url);
        if !unchanged {
            info!(url, "public URL available");
            self.current.store(Some(Arc::new(url.to_string())));
        }
    }

    fn clear(&self) {
        if self.current.swap(None).is_some() {
            info!("public URL withdrawn");
        }
    }
}

impl PublicEndpoint for CloudflaredProvisioner {
    fn current_public_base(&self) -> Option<String> {
        self.current.load().as_deref().cloned()
    }
}

/// Returns `true` when shutdown was requested during the wait.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
