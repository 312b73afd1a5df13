//! The optional console bridge (§4.11): a virtual display, a terminal
//! emulator attached to the VM's supervising multiplexer session, and a
//! remote framebuffer server guarding it with a single-use password.
//!
//! Compiled in unconditionally but inert unless `defaults.console` is
//! configured and its binaries resolve on `$PATH` at bridge-start time —
//! checked lazily so hosts without a display stack still run VMs.

use std::path::PathBuf;

use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConsoleDefaults;
use crate::error::{AgentError, Result};

const PASSWORD_LEN: usize = 12;
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleState {
    pub display: u32,
    pub xvfb_pid: i32,
    pub terminal_pid: i32,
    pub vnc_pid: i32,
    pub port: u16,
    pub password: String,
    pub bind_host: String,
}

fn state_path(run_dir: &std::path::Path, vm_name: &str) -> PathBuf {
    run_dir.join(format!("console-{vm_name}.json"))
}

fn random_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

fn binaries_available(defaults: &ConsoleDefaults) -> bool {
    [&defaults.xvfb_bin, &defaults.vnc_bin, &defaults.terminal_bin]
        .iter()
        .all(|bin| which(bin))
}

fn which(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
        })
        .unwrap_or(false)
}

fn write_password_file(path: &std::path::Path, password: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    std::io::Write::write_all(&mut file, password.as_bytes())?;
    Ok(())
}

fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Start a bridge for `vm_name`, or reuse the persisted one if all three
/// of its processes are still alive.
pub fn start_or_reuse(
    defaults: &ConsoleDefaults,
    run_dir: &std::path::Path,
    vm_name: &str,
    tmux_session: &str,
) -> Result<ConsoleState> {
    let path = state_path(run_dir, vm_name);
    if let Some(existing) = crate::state::store::read_json::<ConsoleState>(&path)? {
        if pid_alive(existing.xvfb_pid) && pid_alive(existing.terminal_pid) && pid_alive(existing.vnc_pid) {
            return Ok(existing);
        }
    }

    if !binaries_available(defaults) {
        return Err(AgentError::Internal(
            "console bridge requested but Xvfb/VNC/terminal binaries are not on PATH".to_string(),
        ));
    }

    let display = allocate_display();
    let geometry = defaults.geometry.clone();
    let xvfb = std::process::Command::new(&defaults.xvfb_bin)
        .arg(format!(":{display}"))
        .arg("-screen")
        .arg("0")
        .arg(&geometry)
        .spawn()
        .map_err(|e| AgentError::Internal(format!("spawning Xvfb: {e}")))?;
    let xvfb_pid = xvfb.id() as i32;

    std::thread::sleep(std::time::Duration::from_millis(300));

    let terminal = std::process::Command::new(&defaults.terminal_bin)
        .env("DISPLAY", format!(":{display}"))
        .arg("-e")
        .arg("tmux")
        .arg("attach-session")
        .arg("-t")
        .arg(tmux_session)
        .spawn()
        .map_err(|e| AgentError::Internal(format!("spawning terminal emulator: {e}")))?;
    let terminal_pid = terminal.id() as i32;

    let port = allocate_port(defaults.port_min, defaults.port_max);
    let password = random_password();
    let password_file = run_dir.join(format!("console-{vm_name}.passwd"));
    write_password_file(&password_file, &password)?;
    let mut vnc = std::process::Command::new(&defaults.vnc_bin)
        .arg(format!(":{display}"))
        .arg("-rfbport")
        .arg(port.to_string())
        .arg("-rfbauth")
        .arg(&password_file)
        .spawn()
        .map_err(|e| AgentError::Internal(format!("spawning VNC server: {e}")))?;
    let vnc_pid = vnc.id() as i32;

    let state = ConsoleState {
        display,
        xvfb_pid,
        terminal_pid,
        vnc_pid,
        port,
        password,
        bind_host: defaults.bind_host.clone(),
    };
    crate::state::store::atomic_write(&path, serde_json::to_string_pretty(&state)?.as_bytes())?;

    let watch_path = path.clone();
    let watch_password_file = password_file.clone();
    let watch_vm = vm_name.to_string();
    std::thread::spawn(move || {
        let _ = vnc.wait();
        info!("console bridge for '{watch_vm}': framebuffer process exited, cleaning up");
        if pid_alive(xvfb_pid) {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(xvfb_pid), nix::sys::signal::Signal::SIGTERM);
        }
        if pid_alive(terminal_pid) {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(terminal_pid), nix::sys::signal::Signal::SIGTERM);
        }
        for stale in [&watch_path, &watch_password_file] {
            if let Err(e) = std::fs::remove_file(stale) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("console bridge for '{watch_vm}': cleanup of {} failed: {e}", stale.display());
                }
            }
        }
    });

    Ok(state)
}

fn allocate_display() -> u32 {
    rand::thread_rng().gen_range(10..1000)
}

fn allocate_port(min: u16, max: u16) -> u16 {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_passwords_are_long_enough_and_url_safe() {
        let password = random_password();
        assert!(password.len() >= 8);
        assert!(password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn port_allocation_respects_range() {
        for _ in 0..50 {
            let port = allocate_port(5900, 5905);
            assert!((5900..=5905).contains(&port));
        }
    }
}
