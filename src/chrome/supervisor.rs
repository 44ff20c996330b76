use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::error::ChromeError;
use super::http::{is_real_chromium, query_version};
use super::locate::{default_user_data_dir, find_chromium_executable};
use super::profile::{ShadowProfile, build_shadow_profile, remove_singleton_locks};

/// Total budget for the post-spawn liveness verification sequence.
const VERIFY_BUDGET: Duration = Duration::from_secs(12);

/// Initial poll interval during verification; doubles up to the cap.
const VERIFY_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
const VERIFY_MAX_INTERVAL: Duration = Duration::from_millis(800);

/// What the caller asked for, profile-wise.
#[derive(Debug, Clone, Default)]
pub struct ProfileRequest {
    /// Profile directory name (e.g. `Default`, `Profile 1`).
    pub profile: Option<String>,
    /// Custom user-data directory, used verbatim when present. When absent
    /// the user's default profile is shadow-cloned.
    pub user_data_dir: Option<PathBuf>,
    /// Explicit Chromium executable override.
    pub chromium_path: Option<PathBuf>,
}

/// A child process the supervisor spawned and owns.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Option<Child>,
    pid: u32,
    port: u16,
}

impl ManagedProcess {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Move the child handle out for the exit monitor task. After this the
    /// `ManagedProcess` keeps only the pid for kill requests.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Terminate the whole process tree. The only caller is the explicit
    /// `close_browser` path; no failure-recovery code kills the browser.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        kill_process_tree(self.pid).await;
    }
}

/// How `ensure_browser` obtained a working browser.
#[derive(Debug)]
pub enum SpawnOutcome {
    /// A real Chromium was already answering on the port; no process was
    /// spawned and none is owned.
    Attached { ws_url: String },
    /// A fresh process was spawned and verified.
    Spawned {
        ws_url: String,
        process: ManagedProcess,
        shadow: Option<ShadowProfile>,
    },
}

/// Ensure a debuggable Chromium exists on `port`.
///
/// Probes first and attaches to a real Chromium if one already answers;
/// look-alikes (WebView, headless shell) are rejected rather than adopted.
/// Otherwise prepares a profile (shadow clone of the user's default unless
/// a custom directory was supplied), locates an executable, spawns it with
/// the hardening argument set, and verifies liveness within a bounded
/// budget.
///
/// # Errors
///
/// - `ChromeError::NotABrowser` when the port is held by a look-alike.
/// - `ChromeError::NotFound` when no executable can be located.
/// - `ChromeError::SpawnFailed` / `ChromeError::FailedToStart` when the
///   process dies or never becomes reachable; `FailedToStart` carries the
///   accumulated diagnostic log.
pub async fn ensure_browser(
    port: u16,
    request: &ProfileRequest,
) -> Result<SpawnOutcome, ChromeError> {
    // Step 1: probe. An answering port either gives us a browser for free
    // or proves we must not touch it.
    if let Ok(version) = query_version("127.0.0.1", port).await {
        if is_real_chromium(&version) {
            info!(port, browser = %version.browser, "attached to running browser");
            return Ok(SpawnOutcome::Attached {
                ws_url: version.ws_debugger_url,
            });
        }
        return Err(ChromeError::NotABrowser {
            port,
            identity: version.browser,
        });
    }

    // Step 2: prepare profile.
    let profile_name = request.profile.clone().unwrap_or_else(|| "Default".into());
    let (data_dir, shadow) = match &request.user_data_dir {
        Some(dir) => (dir.clone(), None),
        None => {
            let source = default_user_data_dir().ok_or_else(|| {
                ChromeError::ProfileError("no default user data directory on this platform".into())
            })?;
            let name = profile_name.clone();
            let shadow = tokio::task::spawn_blocking(move || build_shadow_profile(&source, &name))
                .await
                .map_err(|e| ChromeError::ProfileError(format!("mirror task failed: {e}")))??;
            (shadow.data_dir.clone(), Some(shadow))
        }
    };
    remove_singleton_locks(&data_dir);
    remove_singleton_locks(&data_dir.join(&profile_name));

    // Step 3: locate executable.
    let executable = find_chromium_executable(request.chromium_path.as_deref())?;

    // Step 4: spawn with the hardening set.
    let mut cmd = Command::new(&executable);
    cmd.arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", data_dir.display()))
        .arg(format!("--profile-directory={profile_name}"))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-infobars")
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--password-store=basic")
        .arg("--start-maximized")
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        ChromeError::SpawnFailed(format!("failed to spawn {}: {e}", executable.display()))
    })?;
    let pid = child.id().unwrap_or(0);
    info!(port, pid, exe = %executable.display(), "spawned browser");

    let mut process = ManagedProcess {
        child: Some(child),
        pid,
        port,
    };

    // Step 5: verify liveness with bounded backoff.
    match verify_liveness(&mut process).await {
        Ok(ws_url) => Ok(SpawnOutcome::Spawned {
            ws_url,
            process,
            shadow,
        }),
        Err(e) => {
            // The spawn never produced a usable browser; reap it so we do
            // not leak a zombie tree.
            process.kill().await;
            Err(e)
        }
    }
}

/// The four-step verification sequence: child alive, OS process present,
/// port listening, version answering. Retried until `VERIFY_BUDGET` runs
/// out; every observation is appended to the diagnostic log.
async fn verify_liveness(process: &mut ManagedProcess) -> Result<String, ChromeError> {
    let port = process.port;
    let started = tokio::time::Instant::now();
    let mut interval = VERIFY_INITIAL_INTERVAL;
    let mut diagnostics: Vec<String> = Vec::new();

    loop {
        if let Some(child) = process.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                diagnostics.push(format!("child exited with {status} before becoming ready"));
                return Err(ChromeError::FailedToStart { port, diagnostics });
            }
        }

        if !os_process_exists(process.pid) {
            diagnostics.push(format!("no OS process with pid {}", process.pid));
        } else if !port_is_listening(port).await {
            note_once(&mut diagnostics, format!("port {port} not listening yet"));
        } else {
            match query_version("127.0.0.1", port).await {
                Ok(version) => {
                    debug!(port, elapsed_ms = started.elapsed().as_millis() as u64,
                        "browser verified");
                    return Ok(version.ws_debugger_url);
                }
                Err(e) => note_once(&mut diagnostics, format!("version query failed: {e}")),
            }
        }

        if started.elapsed() >= VERIFY_BUDGET {
            diagnostics.push(format!(
                "gave up after {}ms",
                started.elapsed().as_millis()
            ));
            return Err(ChromeError::FailedToStart { port, diagnostics });
        }

        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(VERIFY_MAX_INTERVAL);
    }
}

/// Append `entry` unless it repeats the previous observation; keeps the
/// diagnostic log readable across hundreds of poll iterations.
fn note_once(diagnostics: &mut Vec<String>, entry: String) {
    if diagnostics.last() != Some(&entry) {
        diagnostics.push(entry);
    }
}

/// Does the OS report a live process with this pid?
fn os_process_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // Signal 0 checks existence without delivering anything.
        #[allow(clippy::cast_possible_wrap)]
        let result = unsafe { libc::kill(pid as i32, 0) };
        result == 0
    }
    #[cfg(windows)]
    {
        // tasklist with a pid filter prints a header plus one row on a hit.
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

/// Is anything accepting TCP connections on the debugging port?
async fn port_is_listening(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_millis(500),
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

/// Terminate a browser process tree: SIGTERM to the process group, poll for
/// exit, then escalate to SIGKILL. Windows delegates to `taskkill /T /F`.
pub async fn kill_process_tree(pid: u32) {
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as i32;

        // Negative pid targets the process group; Chromium's renderers and
        // helpers live in the same group thanks to process_group(0).
        let term_result = unsafe { libc::kill(-pid_i32, libc::SIGTERM) };
        if term_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGTERM) };
        }

        let poll_interval = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if !os_process_exists(pid) {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }

        warn!(pid, "SIGTERM ignored, escalating to SIGKILL");
        let kill_result = unsafe { libc::kill(-pid_i32, libc::SIGKILL) };
        if kill_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGKILL) };
        }
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
    }
}
