//! Detached-session process supervision.
//!
//! Firecracker runs inside a `tmux` session named `fc-<vm>` so it survives
//! this agent restarting; the binary/argv construction mirrors the
//! teacher's direct `Command::new(bin).arg("--api-sock")...` call, just
//! wrapped in a session that outlives us.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::HostDefaults;
use crate::error::{AgentError, Result};
use crate::paths::VmPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    PowerOn,
    PowerOff,
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn session_name(vm_name: &str) -> String {
        format!("fc-{vm_name}")
    }

    /// Launch Firecracker under a fresh detached session, discover its PID,
    /// and return it without waiting for guest boot.
    pub fn start(&self, vm_name: &str, host: &HostDefaults, paths: &VmPaths) -> Result<i32> {
        for dir in [&host.run_dir, &host.conf_dir, &host.log_dir] {
            std::fs::create_dir_all(dir)?;
        }

        if paths.socket_file.exists() {
            std::fs::remove_file(&paths.socket_file)?;
        }

        {
            use std::fs::OpenOptions;
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(&paths.log_file)?;
        }

        let session = Self::session_name(vm_name);
        let _ = std::process::Command::new("tmux")
            .args(["kill-session", "-t", &session])
            .status();

        let status = std::process::Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                &session,
                &host.firecracker_bin,
                "--api-sock",
                &paths.socket_file.to_string_lossy(),
                "--config-file",
                &paths.config_file.to_string_lossy(),
            ])
            .status()
            .map_err(|e| AgentError::Internal(format!("failed to spawn tmux: {e}")))?;
        if !status.success() {
            return Err(AgentError::Internal(format!(
                "tmux new-session exited with {status}"
            )));
        }

        let pid = discover_pid(&host.firecracker_bin, &paths.socket_file, Duration::from_secs(2))
            .ok_or_else(|| {
                AgentError::Internal(format!(
                    "could not discover firecracker pid for '{vm_name}' after launch"
                ))
            })?;
        std::fs::write(&paths.pid_file, pid.to_string())?;
        info!("started firecracker for '{vm_name}' as pid {pid} in session {session}");
        Ok(pid)
    }

    /// Send a guest reset, wait up to `timeout` for the PID to exit
    /// (escalating SIGTERM -> SIGKILL), then unlink pid/socket files.
    pub fn stop(&self, vm_name: &str, paths: &VmPaths, timeout: Duration) -> Result<()> {
        if paths.socket_file.exists() {
            if let Some(pid) = read_pid(&paths.pid_file) {
                if let Err(e) = crate::hypervisor_client::send_ctrl_alt_del(&paths.socket_file) {
                    debug!("ctrl-alt-del for '{vm_name}' (pid {pid}) ignored: {e}");
                }
            }
        }

        if let Some(pid) = read_pid(&paths.pid_file) {
            wait_or_kill(pid, timeout);
        }

        let _ = std::process::Command::new("tmux")
            .args(["kill-session", "-t", &Self::session_name(vm_name)])
            .status();

        for path in [&paths.pid_file, &paths.socket_file] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// `poweron` if the pid is alive, a live PID is discoverable, or the
    /// session still exists; `poweroff` otherwise. Never raises.
    pub fn status(&self, vm_name: &str, host: &HostDefaults, paths: &VmPaths) -> VmStatus {
        if let Some(pid) = read_pid(&paths.pid_file) {
            if pid_alive(pid) {
                return VmStatus::PowerOn;
            }
        }
        if discover_pid(&host.firecracker_bin, &paths.socket_file, Duration::from_millis(0)).is_some() {
            return VmStatus::PowerOn;
        }
        if session_exists(&Self::session_name(vm_name)) {
            return VmStatus::PowerOn;
        }
        VmStatus::PowerOff
    }
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    std::fs::read_to_string(pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn session_exists(session: &str) -> bool {
    std::process::Command::new("tmux")
        .args(["has-session", "-t", session])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Wait up to `timeout` for `pid` to exit, sending SIGTERM then SIGKILL.
fn wait_or_kill(pid: i32, timeout: Duration) {
    let p = Pid::from_raw(pid);
    if !pid_alive(pid) {
        return;
    }

    let _ = kill(p, Signal::SIGTERM);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if pid_alive(pid) {
        warn!("pid {pid} did not exit within timeout, sending SIGKILL");
        let _ = kill(p, Signal::SIGKILL);
    }
}

/// Find a Firecracker process by matching argv (strategy one) or by
/// finding a process with the control socket open (strategy two), polling
/// up to `within` before giving up.
fn discover_pid(bin: &str, socket: &Path, within: Duration) -> Option<i32> {
    let deadline = Instant::now() + within;
    loop {
        if let Some(pid) = scan_cmdline(bin, socket) {
            return Some(pid);
        }
        if let Some(pid) = scan_open_fds(socket) {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn scan_cmdline(bin: &str, socket: &Path) -> Option<i32> {
    let socket = socket.to_string_lossy();
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let cmdline_path = entry.path().join("cmdline");
        let Ok(raw) = std::fs::read(&cmdline_path) else {
            continue;
        };
        let args: Vec<&str> = raw
            .split(|b| *b == 0)
            .filter_map(|s| std::str::from_utf8(s).ok())
            .filter(|s| !s.is_empty())
            .collect();
        if args.iter().any(|a| *a == bin) && args.iter().any(|a| *a == socket) {
            return Some(pid);
        }
    }
    None
}

fn scan_open_fds(socket: &Path) -> Option<i32> {
    let target = std::fs::canonicalize(socket).ok()?;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}
