use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Failure categories tracked by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Validation,
    Resource,
    Plugin,
}

impl ErrorKind {
    /// Per-(session, kind) count beyond which a recoverable error is
    /// treated as unrecoverable.
    #[must_use]
    pub fn threshold(self) -> u32 {
        match self {
            Self::Connection => 3,
            Self::Protocol => 5,
            Self::Validation => 10,
            Self::Resource => 1,
            Self::Plugin => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Plugin => "plugin",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric error codes carried by [`ProxyError`].
pub mod codes {
    /// Upstream WebSocket dial failed.
    pub const DIAL_FAILED: i32 = 1001;
    /// HTTP forwarding to the browser failed.
    pub const HTTP_FORWARD: i32 = 1002;
    /// A relayed socket errored or closed abnormally.
    pub const SOCKET_ABNORMAL: i32 = 1006;
    /// A frame could not be parsed as JSON.
    pub const MALFORMED_FRAME: i32 = 1501;
    /// A plugin failed registration validation.
    pub const INVALID_PLUGIN: i32 = 2001;
    /// A plugin hook raised an error.
    pub const HOOK_FAILED: i32 = 2002;
    /// A plugin-initiated command could not be sent or was rejected.
    pub const COMMAND_FAILED: i32 = 2003;
    /// A plugin-initiated command received no response in time.
    pub const COMMAND_TIMEOUT: i32 = 2004;
    /// A frame failed schema validation.
    pub const SCHEMA_WARNING: i32 = 3001;
    /// The browser process could not be started.
    pub const BROWSER_START: i32 = 4001;
    /// The browser process could not be stopped or cleaned up.
    pub const BROWSER_STOP: i32 = 4002;
}

/// A classified proxy failure.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub recoverable: bool,
}

impl ProxyError {
    #[must_use]
    pub fn connection(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Connection,
            code,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            code: codes::MALFORMED_FRAME,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            code: codes::SCHEMA_WARNING,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    #[must_use]
    pub fn resource(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Resource,
            code,
            message: message.into(),
            details: None,
            recoverable: false,
        }
    }

    #[must_use]
    pub fn plugin(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Plugin,
            code,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error ({}): {}", self.kind, self.code, self.message)
    }
}

impl std::error::Error for ProxyError {}

/// What the classifier decided to do with a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Disconnection noise: traced at debug level, not counted.
    Suppressed,
    /// Logged and absorbed; the caller may continue.
    Recovered,
    /// Unrecoverable (or a counter crossed its threshold): the process
    /// must exit with status 1.
    Fatal,
}

/// Whether a message is ordinary disconnection noise.
///
/// Sockets closing under us is business as usual for a proxy; such
/// failures are traced but never counted against the connection budget.
#[must_use]
pub fn is_disconnect_noise(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    if lower.contains("disconnected") || lower.contains("unexpected eof") {
        return true;
    }
    lower
        .find("connection")
        .is_some_and(|at| lower[at..].contains("closed"))
}

/// Central error classifier.
///
/// Counts failures per `(session, kind)`, decides recoverable vs fatal,
/// and exposes a watch channel the bootstrap observes to terminate the
/// process with exit code 1. Recovery itself is the caller's business;
/// the classifier never retries anything.
pub struct ErrorMonitor {
    counters: Mutex<HashMap<(String, ErrorKind), u32>>,
    fatal_tx: watch::Sender<bool>,
}

const GLOBAL_SCOPE: &str = "global";

impl ErrorMonitor {
    #[must_use]
    pub fn new() -> Self {
        let (fatal_tx, _) = watch::channel(false);
        Self {
            counters: Mutex::new(HashMap::new()),
            fatal_tx,
        }
    }

    /// A receiver that flips to `true` once a fatal error was reported.
    #[must_use]
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    /// Classify and record one error.
    pub fn handle(&self, err: &ProxyError, session_id: Option<&str>) -> Disposition {
        if err.kind == ErrorKind::Connection && is_disconnect_noise(&err.message) {
            debug!(session = session_id, "{err}");
            return Disposition::Suppressed;
        }

        let scope = session_id.unwrap_or(GLOBAL_SCOPE).to_string();
        let count = {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            let slot = counters.entry((scope, err.kind)).or_insert(0);
            *slot += 1;
            *slot
        };

        if err.recoverable && count <= err.kind.threshold() {
            warn!(session = session_id, count, "{err}");
            return Disposition::Recovered;
        }

        error!(
            session = session_id,
            count,
            recoverable = err.recoverable,
            "fatal: {err}"
        );
        self.fatal_tx.send_replace(true);
        Disposition::Fatal
    }

    /// Current count for `(session, kind)`.
    pub fn count(&self, kind: ErrorKind, session_id: Option<&str>) -> u32 {
        let scope = session_id.unwrap_or(GLOBAL_SCOPE);
        self.counters
            .lock()
            .expect("counter lock poisoned")
            .get(&(scope.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Drop every counter belonging to a session (called at teardown so a
    /// reconnecting client starts with a clean budget).
    pub fn clear(&self, session_id: &str) {
        self.counters
            .lock()
            .expect("counter lock poisoned")
            .retain(|(scope, _), _| scope != session_id);
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}
