use std::path::PathBuf;

use clap::Parser;

/// Intercepting proxy for the Chrome DevTools Protocol.
///
/// Sits between a CDP client and a headless browser, relaying every frame
/// through a plugin chain. Configuration is environment-driven; every flag
/// below can also be set via its environment variable.
#[derive(Debug, Parser)]
#[command(name = "cdproxy", version, about)]
pub struct Cli {
    /// Port the proxy listens on.
    #[arg(long, env = "CDP_PROXY_PORT")]
    pub port: u16,

    /// Absolute path to a browser binary; overrides the managed install.
    #[arg(long, env = "CHROMIUM_EXECUTABLE_PATH")]
    pub executable_path: Option<PathBuf>,

    /// Directory holding a managed browser install.
    #[arg(long, env = "CHROMIUM_DIRECTORY")]
    pub chromium_directory: Option<PathBuf>,

    /// Pinned build identifier for the managed install.
    #[arg(long, env = "CHROMIUM_STATIC_VERSION")]
    pub chromium_static_version: Option<String>,

    /// Log level: silent, error, warn, info, debug, log, verbose.
    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Comma-separated module tags to restrict logging to
    /// (e.g. "relay,chrome").
    #[arg(long, env = "PROXY_LOG_TAGS")]
    pub log_tags: Option<String>,
}
