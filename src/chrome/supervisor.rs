use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::discovery;
use super::platform::{self, BrowserLocation};
use super::ChromeError;
use crate::error::{ErrorMonitor, ProxyError, codes};

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub location: BrowserLocation,
    /// Whole-sequence launch attempts.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Interval between `/json/version` readiness probes.
    pub poll_interval: Duration,
    /// Budget for one launch attempt to become ready.
    pub startup_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            location: BrowserLocation::default(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Idle,
    Starting,
    Running,
    Killing,
}

struct RunningBrowser {
    child: Child,
    pid: u32,
    port: u16,
    data_dir: std::path::PathBuf,
    ws_url: String,
}

/// Browser lifecycle supervisor.
///
/// Owns the headless browser process: launches it on a free debug port
/// with retries and backoff, health-checks it over `/json/version`, tracks
/// client-facing connections so they can be drained before a kill, and
/// tears everything down idempotently.
pub struct BrowserSupervisor {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    killing: Arc<AtomicBool>,
    running: Mutex<Option<RunningBrowser>>,
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_connection_id: AtomicU64,
    errors: Arc<ErrorMonitor>,
}

impl BrowserSupervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig, errors: Arc<ErrorMonitor>) -> Self {
        Self {
            config,
            state: Mutex::new(SupervisorState::Idle),
            killing: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            errors,
        }
    }

    /// Shared flag the relay consults to silence browser-side socket
    /// events while a kill is in progress.
    #[must_use]
    pub fn killing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killing)
    }

    #[must_use]
    pub fn is_killing(&self) -> bool {
        self.killing.load(Ordering::SeqCst)
    }

    /// The debug port of the running browser, if any.
    #[must_use]
    pub fn debug_port(&self) -> Option<u16> {
        self.running
            .lock()
            .expect("supervisor lock poisoned")
            .as_ref()
            .map(|rb| rb.port)
    }

    /// Launch the browser and return its WebSocket debugger URL.
    ///
    /// Retries the whole launch sequence with exponential backoff,
    /// force-cleaning between attempts. A second `start` while one is in
    /// flight rejects immediately; `start` on a running browser returns
    /// the existing URL.
    ///
    /// # Errors
    ///
    /// Returns the last launch error once attempts are exhausted.
    pub async fn start(&self) -> Result<String, ChromeError> {
        {
            let mut state = self.state.lock().expect("supervisor lock poisoned");
            match *state {
                SupervisorState::Starting => return Err(ChromeError::AlreadyStarting),
                SupervisorState::Killing => {
                    return Err(ChromeError::LaunchFailed("stop in progress".into()));
                }
                SupervisorState::Running => {
                    let url = self
                        .running
                        .lock()
                        .expect("supervisor lock poisoned")
                        .as_ref()
                        .map(|rb| rb.ws_url.clone());
                    if let Some(url) = url {
                        return Ok(url);
                    }
                    *state = SupervisorState::Starting;
                }
                SupervisorState::Idle => *state = SupervisorState::Starting,
            }
        }

        let mut last_err = ChromeError::LaunchFailed("no launch attempts made".into());
        for attempt in 0..self.config.max_attempts {
            match self.try_launch().await {
                Ok(url) => {
                    *self.state.lock().expect("supervisor lock poisoned") =
                        SupervisorState::Running;
                    info!(url = %url, "browser ready");
                    return Ok(url);
                }
                Err(e) => {
                    warn!(attempt, "browser launch attempt failed: {e}");
                    self.force_cleanup().await;
                    last_err = e;
                    if attempt + 1 < self.config.max_attempts {
                        sleep(self.config.base_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        *self.state.lock().expect("supervisor lock poisoned") = SupervisorState::Idle;
        Err(last_err)
    }

    async fn try_launch(&self) -> Result<String, ChromeError> {
        let executable = platform::resolve_executable(&self.config.location)?;
        let port = platform::find_available_port()?;
        platform::kill_port_listener(port);

        let data_dir = std::env::temp_dir().join(format!(
            "cdproxy-profile-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&data_dir)?;

        let mut cmd = Command::new(&executable);
        cmd.arg("--headless=new")
            .arg(format!("--remote-debugging-port={port}"))
            .arg(format!("--user-data-dir={}", data_dir.display()))
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--enable-automation")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-gpu")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            ChromeError::LaunchFailed(format!("failed to spawn {}: {e}", executable.display()))
        })?;
        let pid = child.id();
        debug!(pid, port, "browser spawned");

        *self.running.lock().expect("supervisor lock poisoned") = Some(RunningBrowser {
            child,
            pid,
            port,
            data_dir,
            ws_url: String::new(),
        });

        let deadline = Instant::now() + self.config.startup_timeout;
        let mut last_bad_url: Option<String> = None;
        loop {
            if Instant::now() > deadline {
                // A browser that kept answering with a malformed URL is a
                // different failure than one that never answered at all.
                return Err(match last_bad_url {
                    Some(url) => ChromeError::BadDebuggerUrl(url),
                    None => ChromeError::StartupTimeout { port },
                });
            }

            {
                let mut running = self.running.lock().expect("supervisor lock poisoned");
                if let Some(rb) = running.as_mut() {
                    if let Ok(Some(status)) = rb.child.try_wait() {
                        return Err(ChromeError::LaunchFailed(format!(
                            "browser exited with {status} before becoming ready"
                        )));
                    }
                }
            }

            match discovery::query_version("127.0.0.1", port).await {
                Ok(version) if discovery::is_browser_debugger_url(&version.ws_debugger_url, port) => {
                    let mut running = self.running.lock().expect("supervisor lock poisoned");
                    if let Some(rb) = running.as_mut() {
                        rb.ws_url.clone_from(&version.ws_debugger_url);
                    }
                    return Ok(version.ws_debugger_url);
                }
                Ok(version) => {
                    debug!(url = %version.ws_debugger_url, "debugger URL not usable yet");
                    last_bad_url = Some(version.ws_debugger_url);
                }
                Err(_) => {}
            }

            sleep(self.config.poll_interval).await;
        }
    }

    /// Tear the browser down. Idempotent; a concurrent `stop` returns
    /// while the first one finishes.
    pub async fn stop(&self) {
        if self.killing.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().expect("supervisor lock poisoned") = SupervisorState::Killing;

        self.close_connections(Duration::from_secs(2)).await;

        let taken = self.running.lock().expect("supervisor lock poisoned").take();
        if let Some(mut rb) = taken {
            platform::kill_process_tree(rb.pid);
            let _ = rb.child.try_wait();
            if let Err(e) = remove_dir_with_retry(&rb.data_dir).await {
                self.errors.handle(
                    &ProxyError::resource(
                        codes::BROWSER_STOP,
                        format!("could not remove {}: {e}", rb.data_dir.display()),
                    ),
                    None,
                );
            }
            platform::kill_port_listener(rb.port);
            info!(pid = rb.pid, "browser stopped");
        }

        *self.state.lock().expect("supervisor lock poisoned") = SupervisorState::Idle;
        self.killing.store(false, Ordering::SeqCst);
    }

    /// Kill whatever a failed launch attempt left behind.
    async fn force_cleanup(&self) {
        let taken = self.running.lock().expect("supervisor lock poisoned").take();
        if let Some(mut rb) = taken {
            platform::kill_process_tree(rb.pid);
            let _ = rb.child.try_wait();
            platform::kill_port_listener(rb.port);
            let _ = remove_dir_with_retry(&rb.data_dir).await;
        }
        self.close_connections(Duration::from_millis(500)).await;
    }

    /// Track a client-facing connection's outbound handle so `stop` can
    /// close it before killing the browser.
    pub fn register_connection(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("supervisor lock poisoned")
            .insert(id, tx);
        id
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections
            .lock()
            .expect("supervisor lock poisoned")
            .remove(&id);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("supervisor lock poisoned")
            .len()
    }

    async fn close_connections(&self, grace: Duration) {
        let senders: Vec<(u64, mpsc::UnboundedSender<Message>)> = self
            .connections
            .lock()
            .expect("supervisor lock poisoned")
            .drain()
            .collect();
        if senders.is_empty() {
            return;
        }
        for (_, tx) in &senders {
            let _ = tx.send(Message::Close(None));
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && senders.iter().any(|(_, tx)| !tx.is_closed()) {
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Re-read the current WebSocket debugger URL from `/json/version`.
    ///
    /// # Errors
    ///
    /// Returns `ChromeError::NotRunning` without a browser, or an HTTP
    /// error when the endpoint is unreachable.
    pub async fn websocket_url(&self) -> Result<String, ChromeError> {
        let port = self.debug_port().ok_or(ChromeError::NotRunning)?;
        let version = discovery::query_version("127.0.0.1", port).await?;
        Ok(version.ws_debugger_url)
    }
}

async fn remove_dir_with_retry(path: &Path) -> std::io::Result<()> {
    let mut last = None;
    for _ in 0..3 {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                // EBUSY right after the kill is common; the files free up
                // once the last browser child exits.
                last = Some(e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| std::io::Error::other("retries exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(executable: Option<std::path::PathBuf>) -> SupervisorConfig {
        SupervisorConfig {
            location: BrowserLocation {
                executable_path: executable,
                directory: Some(std::path::PathBuf::from("/nonexistent-managed-dir")),
                static_version: None,
            },
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            startup_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn start_without_executable_exhausts_attempts() {
        let supervisor = BrowserSupervisor::new(
            quick_config(Some("/nonexistent/browser".into())),
            Arc::new(ErrorMonitor::new()),
        );
        let result = supervisor.start().await;
        assert!(matches!(result, Err(ChromeError::NotFound(_))));
        // State returned to idle; a second start is allowed (and fails
        // the same way rather than with AlreadyStarting).
        let again = supervisor.start().await;
        assert!(matches!(again, Err(ChromeError::NotFound(_))));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let supervisor =
            BrowserSupervisor::new(quick_config(None), Arc::new(ErrorMonitor::new()));
        supervisor.stop().await;
        assert!(!supervisor.is_killing());
        assert_eq!(supervisor.debug_port(), None);
    }

    #[tokio::test]
    async fn websocket_url_requires_running_browser() {
        let supervisor =
            BrowserSupervisor::new(quick_config(None), Arc::new(ErrorMonitor::new()));
        assert!(matches!(
            supervisor.websocket_url().await,
            Err(ChromeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn connection_bookkeeping() {
        let supervisor =
            BrowserSupervisor::new(quick_config(None), Arc::new(ErrorMonitor::new()));
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id1 = supervisor.register_connection(tx1);
        let _id2 = supervisor.register_connection(tx2);
        assert_eq!(supervisor.connection_count(), 2);
        supervisor.unregister_connection(id1);
        assert_eq!(supervisor.connection_count(), 1);
    }

    #[tokio::test]
    async fn stop_sends_close_to_tracked_connections() {
        let supervisor =
            BrowserSupervisor::new(quick_config(None), Arc::new(ErrorMonitor::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor.register_connection(tx);

        // Drop the receiver after the close frame arrives so stop's
        // drain loop completes promptly.
        let reader = tokio::spawn(async move {
            let msg = rx.recv().await;
            assert!(matches!(msg, Some(Message::Close(_))));
        });

        supervisor.stop().await;
        reader.await.unwrap();
        assert_eq!(supervisor.connection_count(), 0);
    }

    #[tokio::test]
    async fn killing_flag_is_shared() {
        let supervisor =
            BrowserSupervisor::new(quick_config(None), Arc::new(ErrorMonitor::new()));
        let flag = supervisor.killing_flag();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
