use serde::Deserialize;
use tokio::net::TcpStream;

use super::ChromeError;
use crate::httpio::{self, RequestHead};

/// Browser version information returned by `/json/version`.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// The browser name and version (e.g. "HeadlessChrome/131.0.6778.85").
    #[serde(rename = "Browser", default)]
    pub browser: Option<String>,

    /// The browser-level WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// Query the browser's `/json/version` endpoint.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` on connection failure or
/// `ChromeError::ParseError` if the response cannot be deserialized.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_slice(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Perform a plain HTTP GET against the debug endpoint.
async fn http_get(host: &str, port: u16, path: &str) -> Result<Vec<u8>, ChromeError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ChromeError::HttpError(format!("connect to {host}:{port} failed: {e}")))?;

    let head = RequestHead {
        method: "GET".into(),
        target: path.into(),
        version: "HTTP/1.1".into(),
        headers: vec![
            ("Host".into(), format!("{host}:{port}")),
            ("Connection".into(), "close".into()),
        ],
    };
    httpio::write_request(&mut stream, &head, &[])
        .await
        .map_err(|e| ChromeError::HttpError(format!("write failed: {e}")))?;

    let response = httpio::read_response(&mut stream)
        .await
        .map_err(|e| ChromeError::HttpError(format!("read failed: {e}")))?;
    if response.status != 200 {
        return Err(ChromeError::HttpError(format!(
            "unexpected HTTP status {} for {path}",
            response.status
        )));
    }
    Ok(response.body)
}

/// Port component of a `ws://host:port/...` URL.
fn ws_url_port(url: &str) -> Option<u16> {
    let without_scheme = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))?;
    let host_port = without_scheme.split('/').next()?;
    host_port.rsplit(':').next()?.parse().ok()
}

/// Whether a debugger URL has the browser-endpoint shape the supervisor
/// requires: `ws://<host>:<port>/devtools/browser/<id>`.
#[must_use]
pub fn is_browser_debugger_url(url: &str, port: u16) -> bool {
    url.starts_with("ws://") && ws_url_port(url) == Some(port) && {
        let path_start = url["ws://".len()..]
            .find('/')
            .map(|i| i + "ws://".len());
        path_start.is_some_and(|i| {
            url[i..].starts_with("/devtools/browser/") && url.len() > i + "/devtools/browser/".len()
        })
    }
}
