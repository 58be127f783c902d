use crate::chrome::{BrowserLocation, SupervisorConfig};
use crate::cli::Cli;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on.
    pub port: u16,
    /// Browser supervisor settings.
    pub supervisor: SupervisorConfig,
    /// `tracing` filter directives compiled from the log environment.
    pub log_filter: String,
}

impl ProxyConfig {
    #[must_use]
    pub fn from_cli(cli: &Cli) -> Self {
        let supervisor = SupervisorConfig {
            location: BrowserLocation {
                executable_path: cli.executable_path.clone(),
                directory: cli.chromium_directory.clone(),
                static_version: cli.chromium_static_version.clone(),
            },
            ..SupervisorConfig::default()
        };
        Self {
            port: cli.port,
            supervisor,
            log_filter: log_filter(&cli.log_level, cli.log_tags.as_deref()),
        }
    }
}

/// Translate the proxy's log level names to a `tracing` level.
///
/// `log` is an alias for `info` and `verbose` for `trace`; both exist for
/// operators used to console-style level names.
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "silent" => "off",
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "verbose" => "trace",
        // "info", "log", and anything unrecognized.
        _ => "info",
    }
}

/// Build the `tracing-subscriber` filter string for a level and an
/// optional comma-separated tag list. Tags name this crate's modules
/// (`relay`, `chrome`, `plugins`, ...); when present, only those modules
/// log and everything else is off.
#[must_use]
pub fn log_filter(level: &str, tags: Option<&str>) -> String {
    let level = level_directive(level);
    match tags {
        None | Some("") => format!("cdproxy={level}"),
        Some(tags) => {
            let mut directives = vec!["cdproxy=off".to_string()];
            for tag in tags.split(',') {
                let tag = tag.trim();
                if !tag.is_empty() {
                    directives.push(format!("cdproxy::{tag}={level}"));
                }
            }
            directives.join(",")
        }
    }
}
