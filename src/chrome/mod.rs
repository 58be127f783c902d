mod discovery;
mod error;
mod platform;
mod supervisor;

pub use discovery::{BrowserVersion, is_browser_debugger_url, query_version};
pub use error::ChromeError;
pub use platform::{BrowserLocation, find_available_port};
pub use supervisor::{BrowserSupervisor, SupervisorConfig};
