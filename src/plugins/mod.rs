//! The plugin pipeline.
//!
//! Every relayed frame flows through an ordered chain of plugins, each of
//! which may pass it on (possibly mutated), suppress it, or fail in
//! isolation. Plugins can also originate CDP commands to the browser and
//! emit synthetic events to the client via the context passed to every
//! hook.

mod runtime;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

pub use runtime::{PluginContext, PluginRuntime, CLEANUP_TIMEOUT, PLUGIN_COMMAND_TIMEOUT};

/// Which frame shapes a plugin wants to see.
///
/// Registration rejects an empty set: a plugin that hooks nothing is a
/// configuration mistake, not a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    pub requests: bool,
    pub responses: bool,
    pub events: bool,
}

impl HookSet {
    #[must_use]
    pub fn is_empty(self) -> bool {
        !(self.requests || self.responses || self.events)
    }

    #[must_use]
    pub fn all() -> Self {
        Self {
            requests: true,
            responses: true,
            events: true,
        }
    }

    #[must_use]
    pub fn requests() -> Self {
        Self {
            requests: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn responses() -> Self {
        Self {
            responses: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn events() -> Self {
        Self {
            events: true,
            ..Self::default()
        }
    }
}

/// Error raised by a plugin hook. Captured by the runtime and reported;
/// never propagated past the chain.
#[derive(Debug)]
pub struct PluginHookError(pub String);

impl fmt::Display for PluginHookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PluginHookError {}

impl From<String> for PluginHookError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for PluginHookError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Result of one hook invocation: `Ok(Some(_))` passes a (possibly
/// mutated) message to the next plugin, `Ok(None)` suppresses the frame.
pub type HookResult = Result<Option<Value>, PluginHookError>;

/// A frame interceptor.
///
/// Implementations declare which shapes they handle via [`hooks`];
/// only the matching hook methods are ever invoked. Hooks run in
/// registration order, one message at a time per session direction, and
/// may call back into the proxy through the [`PluginContext`].
///
/// [`hooks`]: ProxyPlugin::hooks
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// The hook set this plugin participates in. Must be non-empty.
    fn hooks(&self) -> HookSet;

    /// A client command on its way to the browser.
    async fn on_request(&self, cx: &PluginContext<'_>, request: Value) -> HookResult {
        let _ = cx;
        Ok(Some(request))
    }

    /// A browser reply on its way to the client.
    async fn on_response(&self, cx: &PluginContext<'_>, response: Value) -> HookResult {
        let _ = cx;
        Ok(Some(response))
    }

    /// A browser event on its way to the client.
    async fn on_event(&self, cx: &PluginContext<'_>, event: Value) -> HookResult {
        let _ = cx;
        Ok(Some(event))
    }

    /// Called once at shutdown, racing the cleanup timeout.
    async fn cleanup(&self) -> Result<(), PluginHookError> {
        Ok(())
    }
}

/// One entry in the compile-time plugin registry.
///
/// Plugins link into the binary and self-register here; `disabled`
/// entries are kept in the list but skipped at bootstrap, the static
/// equivalent of renaming a plugin file out of the scan.
pub struct RegistryEntry {
    pub disabled: bool,
    pub build: fn() -> Box<dyn ProxyPlugin>,
}

/// The built-in plugin registry. Ships empty; deployments add entries
/// for the plugins they link in.
#[must_use]
pub fn builtin() -> Vec<RegistryEntry> {
    Vec::new()
}
