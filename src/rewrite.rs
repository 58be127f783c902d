//! Rewrites browser-origin WebSocket URLs so clients only ever see the
//! proxy.
//!
//! Every `/json/*` response from the browser advertises WebSocket URLs
//! pointing at the browser's own debug port. Handing those to a client
//! would let it bypass the proxy entirely, so every such URL is rewritten
//! to `localhost:<proxy_port>` with its path and query preserved.

use serde_json::Value;
use tracing::warn;
use url::Url;

/// CDP WebSocket path prefixes that mark a string as a debugger URL.
pub const WS_PATH_PREFIXES: [&str; 3] =
    ["/devtools/browser", "/devtools/page", "/devtools/inspector"];

/// Top-level fields that always carry plain WebSocket URLs.
const WS_URL_KEYS: [&str; 2] = ["webSocketDebuggerUrl", "debuggerUrl"];

/// The frontend URL embeds the debugger URL in a `ws=` query parameter.
const FRONTEND_URL_KEY: &str = "devtoolsFrontendUrl";

/// Rewrite every WebSocket URL in a parsed `/json/*` body in place.
///
/// Arrays and nested objects are walked recursively. Already-rewritten
/// bodies come out unchanged, and a string that fails to parse as a URL
/// is kept as-is with a warning.
pub fn rewrite_body(body: &mut Value, proxy_port: u16) {
    match body {
        Value::Array(items) => {
            for item in items {
                rewrite_body(item, proxy_port);
            }
        }
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Value::String(s) => {
                        if let Some(rewritten) = rewrite_string_field(key, s, proxy_port) {
                            *s = rewritten;
                        }
                    }
                    Value::Array(_) | Value::Object(_) => rewrite_body(value, proxy_port),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Rewrite one string field, returning the replacement if any applies.
fn rewrite_string_field(key: &str, value: &str, proxy_port: u16) -> Option<String> {
    if key == FRONTEND_URL_KEY {
        return rewrite_frontend_url(value, proxy_port);
    }
    if WS_URL_KEYS.contains(&key) || mentions_ws_path(value) {
        return rewrite_ws_url(value, proxy_port);
    }
    None
}

fn mentions_ws_path(value: &str) -> bool {
    WS_PATH_PREFIXES.iter().any(|p| value.contains(p))
}

/// Point a `ws://` / `wss://` URL at the proxy, keeping path and query.
///
/// Strings that mention a devtools path but are not absolute WebSocket
/// URLs (bare paths, frontend page URLs) have no host to rewrite and are
/// left alone.
fn rewrite_ws_url(value: &str, proxy_port: u16) -> Option<String> {
    let mut parsed = match Url::parse(value) {
        Ok(parsed) => parsed,
        Err(_) => {
            if value.starts_with("ws://") || value.starts_with("wss://") {
                warn!(url = value, "could not parse WebSocket URL; leaving original");
            }
            return None;
        }
    };
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return None;
    }
    if parsed.set_host(Some("localhost")).is_err() || parsed.set_port(Some(proxy_port)).is_err() {
        warn!(url = value, "could not rewrite WebSocket URL; leaving original");
        return None;
    }
    Some(parsed.into())
}

/// Rewrite the `ws=`/`wss=` parameter inside a devtools frontend URL.
///
/// The parameter value is a scheme-less `host:port/path` string, often
/// percent-encoded. Only its authority is replaced.
fn rewrite_frontend_url(value: &str, proxy_port: u16) -> Option<String> {
    let (base, query) = value.split_once('?')?;
    let mut changed = false;
    let rewritten: Vec<String> = query
        .split('&')
        .map(|pair| {
            let Some((name, param)) = pair.split_once('=') else {
                return pair.to_string();
            };
            if name != "ws" && name != "wss" {
                return pair.to_string();
            }
            let decoded = match urlencoding::decode(param) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => {
                    warn!(url = value, "undecodable ws parameter; leaving original");
                    return pair.to_string();
                }
            };
            let Some(slash) = decoded.find('/') else {
                return pair.to_string();
            };
            changed = true;
            let replacement = format!("localhost:{proxy_port}{}", &decoded[slash..]);
            format!("{name}={}", urlencoding::encode(&replacement))
        })
        .collect();

    changed.then(|| format!("{base}?{}", rewritten.join("&")))
}
