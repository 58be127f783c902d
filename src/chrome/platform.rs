use std::path::PathBuf;
use std::time::Duration;

use super::ChromeError;

/// Inputs for locating the browser binary.
#[derive(Debug, Clone, Default)]
pub struct BrowserLocation {
    /// Explicit executable path; wins over everything else.
    pub executable_path: Option<PathBuf>,
    /// Directory holding a managed install.
    pub directory: Option<PathBuf>,
    /// Pinned build identifier under the managed directory.
    pub static_version: Option<String>,
}

/// Resolve the browser executable to launch.
///
/// Order: explicit executable path, then the managed install directory
/// (optionally pinned to a build id), then well-known system locations.
///
/// # Errors
///
/// Returns `ChromeError::NotFound` when no candidate exists on disk.
pub fn resolve_executable(location: &BrowserLocation) -> Result<PathBuf, ChromeError> {
    if let Some(path) = &location.executable_path {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(ChromeError::NotFound(format!(
            "CHROMIUM_EXECUTABLE_PATH does not exist: {}",
            path.display()
        )));
    }

    if let Some(dir) = &location.directory {
        let roots = match &location.static_version {
            Some(version) => vec![dir.join(version)],
            None => vec![dir.clone()],
        };
        for root in roots {
            for sub in managed_install_subpaths() {
                let candidate = root.join(sub);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
    }

    for candidate in system_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ChromeError::NotFound(
        "no browser executable found; set CHROMIUM_EXECUTABLE_PATH or CHROMIUM_DIRECTORY".into(),
    ))
}

/// Relative executable paths inside a managed install directory.
fn managed_install_subpaths() -> &'static [&'static str] {
    #[cfg(target_os = "linux")]
    {
        &["chrome-linux/chrome", "chrome"]
    }
    #[cfg(target_os = "macos")]
    {
        &[
            "chrome-mac/Chromium.app/Contents/MacOS/Chromium",
            "Chromium.app/Contents/MacOS/Chromium",
        ]
    }
    #[cfg(target_os = "windows")]
    {
        &["chrome-win\\chrome.exe", "chrome.exe"]
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        &[]
    }
}

/// Well-known system browser locations, tried last.
fn system_candidates() -> Vec<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let path_dirs: Vec<PathBuf> = std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .map(PathBuf::from)
            .collect();
        let names = ["chromium", "chromium-browser", "google-chrome"];
        let mut candidates = Vec::new();
        for name in names {
            for dir in &path_dirs {
                candidates.push(dir.join(name));
            }
        }
        candidates
    }
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        ]
    }
    #[cfg(target_os = "windows")]
    {
        let program_files = std::env::var("ProgramFiles").unwrap_or_default();
        vec![PathBuf::from(program_files).join("Google/Chrome/Application/chrome.exe")]
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        vec![]
    }
}

/// Find an available TCP port on localhost.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if binding fails.
pub fn find_available_port() -> Result<u16, ChromeError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        ChromeError::LaunchFailed(format!("could not bind to find a free port: {e}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ChromeError::LaunchFailed(format!("could not get local address: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Best-effort kill of whatever is listening on a TCP port.
///
/// A stale browser from a crashed run can still hold the debug port;
/// failures here are ignored and the launch proceeds regardless.
pub fn kill_port_listener(port: u16) {
    #[cfg(unix)]
    {
        let output = std::process::Command::new("lsof")
            .args(["-ti", &format!("tcp:{port}"), "-sTCP:LISTEN"])
            .output();
        if let Ok(output) = output {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Ok(pid) = line.trim().parse::<i32>() {
                    // SAFETY: sending SIGKILL to a specific pid we just read.
                    unsafe { libc::kill(pid, libc::SIGKILL) };
                }
            }
        }
    }
    #[cfg(windows)]
    {
        let output = std::process::Command::new("netstat").args(["-ano", "-p", "tcp"]).output();
        if let Ok(output) = output {
            let needle = format!(":{port} ");
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if line.contains(&needle) && line.contains("LISTENING") {
                    if let Some(pid) = line.split_whitespace().last() {
                        let _ = std::process::Command::new("taskkill")
                            .args(["/F", "/PID", pid])
                            .output();
                    }
                }
            }
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = port;
    }
}

/// Terminate a browser process tree: TERM the group, wait up to two
/// seconds, then escalate to KILL.
pub fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        // PID values fit in i32 on all supported platforms.
        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as i32;

        // A negative pid targets the whole process group, taking the
        // renderer and GPU children down with the main process.
        // SAFETY: plain signal delivery.
        let term = unsafe { libc::kill(-pid_i32, libc::SIGTERM) };
        if term != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGTERM) };
        }

        let poll = Duration::from_millis(100);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            // Signal 0 probes for existence without delivering anything.
            // SAFETY: null signal, existence check only.
            if unsafe { libc::kill(pid_i32, 0) } != 0 {
                return;
            }
            std::thread::sleep(poll);
        }

        let kill = unsafe { libc::kill(-pid_i32, libc::SIGKILL) };
        if kill != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGKILL) };
        }
    }
    #[cfg(windows)]
    {
        // /T kills the process tree, /F forces termination.
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
    }
}
