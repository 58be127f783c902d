use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

use super::{HookSet, ProxyPlugin};
use crate::cdp::{self, FrameKind, PLUGIN_MESSAGE_ID_BASE};
use crate::error::{ErrorMonitor, ProxyError, codes};
use crate::registry::SessionRegistry;

/// How long a plugin-initiated command waits for its response.
pub const PLUGIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long plugin cleanup may run at shutdown before being abandoned.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

type PendingResponse = oneshot::Sender<Result<Value, ProxyError>>;

/// Capabilities handed to every hook invocation.
pub struct PluginContext<'a> {
    runtime: &'a PluginRuntime,
    /// The proxy session whose frame is being processed.
    pub session_id: &'a str,
}

impl PluginContext<'_> {
    /// Send a CDP command to the browser and await its response.
    ///
    /// The command is stamped with an ID from the plugin range; the
    /// matching response is consumed by the relay and routed back here,
    /// never to the client. `endpoint` names the debugger endpoint the
    /// caller is working against and is recorded for diagnostics.
    ///
    /// # Errors
    ///
    /// Fails when the session is unknown, the browser socket is not
    /// open, or no response arrives within the command timeout.
    pub async fn send_cdp_command(
        &self,
        endpoint: &str,
        session_id: &str,
        request: Value,
    ) -> Result<Value, ProxyError> {
        self.runtime
            .send_cdp_command(endpoint, session_id, request)
            .await
    }

    /// Emit a synthetic event directly onto a session's client socket.
    ///
    /// # Errors
    ///
    /// Fails when the session is unknown or the client socket is not
    /// open.
    pub fn emit_client_event(&self, session_id: &str, event: &Value) -> Result<(), ProxyError> {
        self.runtime.emit_client_event(session_id, event)
    }
}

/// Ordered plugin chain plus the correlation state for plugin-initiated
/// commands.
pub struct PluginRuntime {
    plugins: Mutex<Vec<Arc<dyn ProxyPlugin>>>,
    registry: Arc<SessionRegistry>,
    errors: Arc<ErrorMonitor>,
    next_command_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingResponse>>,
}

impl PluginRuntime {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, errors: Arc<ErrorMonitor>) -> Self {
        Self {
            plugins: Mutex::new(Vec::new()),
            registry,
            errors,
            next_command_id: AtomicU64::new(PLUGIN_MESSAGE_ID_BASE),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a plugin at the end of the chain.
    ///
    /// A plugin declaring no hooks is reported as a recoverable plugin
    /// error and ignored.
    pub fn register(&self, plugin: Box<dyn ProxyPlugin>) -> bool {
        if plugin.hooks().is_empty() {
            self.errors.handle(
                &ProxyError::plugin(
                    codes::INVALID_PLUGIN,
                    format!("plugin {} declares no hooks", plugin.name()),
                ),
                None,
            );
            return false;
        }
        self.plugins
            .lock()
            .expect("plugin list poisoned")
            .push(Arc::from(plugin));
        true
    }

    /// Remove a plugin by name. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut plugins = self.plugins.lock().expect("plugin list poisoned");
        let before = plugins.len();
        plugins.retain(|p| p.name() != name);
        plugins.len() != before
    }

    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .lock()
            .expect("plugin list poisoned")
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Run one frame through the chain.
    ///
    /// Returns the frame to forward, or `None` when a plugin suppressed
    /// it. Frames the proxy cannot classify skip the chain untouched. A
    /// failing hook is reported and the chain continues with the value
    /// the previous plugin produced.
    pub async fn process(&self, session_id: &str, message: Value) -> Option<Value> {
        let Some(kind) = cdp::classify(&message) else {
            return Some(message);
        };

        let snapshot: Vec<Arc<dyn ProxyPlugin>> = self
            .plugins
            .lock()
            .expect("plugin list poisoned")
            .clone();

        let mut current = message;
        for plugin in snapshot {
            if !covers(plugin.hooks(), kind) {
                continue;
            }
            let cx = PluginContext {
                runtime: self,
                session_id,
            };
            let outcome = match kind {
                FrameKind::Request => plugin.on_request(&cx, current.clone()).await,
                FrameKind::Response => plugin.on_response(&cx, current.clone()).await,
                FrameKind::Event => plugin.on_event(&cx, current.clone()).await,
            };
            match outcome {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!(
                        plugin = plugin.name(),
                        method = cdp::method(&current),
                        "frame suppressed"
                    );
                    return None;
                }
                Err(e) => {
                    self.errors.handle(
                        &ProxyError::plugin(
                            codes::HOOK_FAILED,
                            format!("plugin {} hook failed: {e}", plugin.name()),
                        ),
                        Some(session_id),
                    );
                }
            }
        }
        Some(current)
    }

    /// Intercept a browser response whose ID belongs to the plugin
    /// range. Returns `true` when the message was consumed (matched a
    /// pending command, or was stale and dropped) and must not be
    /// forwarded.
    pub fn try_resolve_response(&self, message: &Value) -> bool {
        let Some(id) = cdp::message_id(message) else {
            return false;
        };
        if id < PLUGIN_MESSAGE_ID_BASE || cdp::classify(message) != Some(FrameKind::Response) {
            return false;
        }

        let entry = self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&id);
        match entry {
            Some(tx) => {
                let outcome = if cdp::is_error_response(message) {
                    Err(ProxyError::plugin(
                        codes::COMMAND_FAILED,
                        message["error"]["message"]
                            .as_str()
                            .unwrap_or("command rejected by browser")
                            .to_string(),
                    )
                    .with_details(message["error"].clone()))
                } else {
                    Ok(message.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = tx.send(outcome);
            }
            None => {
                debug!(id, "stale plugin command response dropped");
            }
        }
        true
    }

    async fn send_cdp_command(
        &self,
        endpoint: &str,
        session_id: &str,
        mut request: Value,
    ) -> Result<Value, ProxyError> {
        let session = self.registry.get(session_id).ok_or_else(|| {
            ProxyError::plugin(
                codes::COMMAND_FAILED,
                format!("unknown session: {session_id}"),
            )
        })?;

        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        request["id"] = id.into();
        debug!(endpoint, id, method = cdp::method(&request), "plugin command");

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        let serialized = request.to_string();
        if let Err(e) = session.link.send_to_browser(serialized) {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(e);
        }

        match timeout(PLUGIN_COMMAND_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProxyError::plugin(
                codes::COMMAND_FAILED,
                "response channel dropped",
            )),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                Err(ProxyError::plugin(
                    codes::COMMAND_TIMEOUT,
                    format!("no response to plugin command {id} within 5s"),
                ))
            }
        }
    }

    fn emit_client_event(&self, session_id: &str, event: &Value) -> Result<(), ProxyError> {
        let session = self.registry.get(session_id).ok_or_else(|| {
            ProxyError::plugin(
                codes::COMMAND_FAILED,
                format!("unknown session: {session_id}"),
            )
        })?;
        session.link.send_to_client(event.to_string())
    }

    /// Run every plugin's cleanup concurrently, racing the cleanup
    /// timeout, then empty the chain. Cleanup failures are reported but
    /// never propagated.
    pub async fn clear_plugins(&self) {
        let drained: Vec<Arc<dyn ProxyPlugin>> = std::mem::take(
            &mut *self.plugins.lock().expect("plugin list poisoned"),
        );
        if drained.is_empty() {
            return;
        }

        let cleanups = join_all(drained.iter().map(|p| p.cleanup()));
        match timeout(CLEANUP_TIMEOUT, cleanups).await {
            Ok(results) => {
                for (plugin, result) in drained.iter().zip(results) {
                    if let Err(e) = result {
                        self.errors.handle(
                            &ProxyError::plugin(
                                codes::HOOK_FAILED,
                                format!("plugin {} cleanup failed: {e}", plugin.name()),
                            ),
                            None,
                        );
                    }
                }
            }
            Err(_) => {
                warn!("plugin cleanup did not finish within 5s; abandoned");
            }
        }
    }
}

fn covers(hooks: HookSet, kind: FrameKind) -> bool {
    match kind {
        FrameKind::Request => hooks.requests,
        FrameKind::Response => hooks.responses,
        FrameKind::Event => hooks.events,
    }
}
