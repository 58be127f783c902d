use std::fmt;

use crate::error::{ProxyError, codes};

/// Errors from browser lifecycle management.
#[derive(Debug)]
pub enum ChromeError {
    /// No usable browser executable could be located.
    NotFound(String),

    /// The browser process failed to spawn or exited early.
    LaunchFailed(String),

    /// The debug endpoint never became ready within the startup window.
    StartupTimeout {
        /// The port the browser was expected to listen on.
        port: u16,
    },

    /// The debug endpoint answered with something unusable.
    BadDebuggerUrl(String),

    /// HTTP request to the debug endpoint failed.
    HttpError(String),

    /// A debug endpoint response could not be parsed.
    ParseError(String),

    /// `start` was called while a start was already in flight.
    AlreadyStarting,

    /// The supervisor has no running browser.
    NotRunning,

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "browser not found: {msg}"),
            Self::LaunchFailed(msg) => write!(f, "browser launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(f, "browser startup timed out on port {port}")
            }
            Self::BadDebuggerUrl(url) => {
                write!(f, "debug endpoint returned an unusable WebSocket URL: {url}")
            }
            Self::HttpError(msg) => write!(f, "browser HTTP error: {msg}"),
            Self::ParseError(msg) => write!(f, "browser response parse error: {msg}"),
            Self::AlreadyStarting => write!(f, "browser start already in progress"),
            Self::NotRunning => write!(f, "no browser is running"),
            Self::Io(e) => write!(f, "browser I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ChromeError> for ProxyError {
    fn from(e: ChromeError) -> Self {
        match &e {
            ChromeError::HttpError(_) | ChromeError::ParseError(_) => {
                ProxyError::connection(codes::HTTP_FORWARD, e.to_string())
            }
            _ => ProxyError::resource(codes::BROWSER_START, e.to_string()),
        }
    }
}
