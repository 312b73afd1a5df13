//! VLAN-aware dataplane backends (§4.4): a plain Linux bridge with 802.1Q
//! port VLANs, or an Open vSwitch bridge with access/trunk ports.

mod linux_bridge;
mod ovs;

use log::debug;
use std::process::Command;

use crate::config::NetDefaults;
use crate::error::{AgentError, Result};
use crate::paths::VmPaths;
use crate::spec::Spec;

pub use linux_bridge::LinuxBridgeVlan;
pub use ovs::OvsVlan;

/// Programs and tears down the TAPs and VLAN state backing one VM's NICs.
pub trait NetworkingBackend {
    /// Idempotently ensure every NIC's TAP exists, is attached, and carries
    /// the right VLAN programming. Returns the TAP names created/ensured.
    fn prepare(&self, spec: &Spec, paths: &VmPaths) -> Result<Vec<String>>;

    /// Remove the VM's TAPs and any VLAN ids on the uplink no longer
    /// referenced by a remaining TAP. A second call is a no-op.
    fn teardown(&self, spec: &Spec, paths: &VmPaths) -> Result<()>;
}

/// Select a backend by `net.driver`.
pub fn backend_for(defaults: &NetDefaults) -> Box<dyn NetworkingBackend> {
    match defaults.driver.as_str() {
        "ovs-vlan" => Box::new(OvsVlan),
        _ => Box::new(LinuxBridgeVlan),
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!("network: running {program} {}", args.join(" "));
    let status = Command::new(program).args(args).status().map_err(|e| {
        AgentError::Networking(format!("failed to spawn {program}: {e}"))
    })?;
    if !status.success() {
        return Err(AgentError::Networking(format!(
            "{program} {} exited with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

/// Best-effort variant of `run_command`: logs a failure at `warn!` instead
/// of propagating it, for teardown and FDB-priming-removal steps that must
/// tolerate the interface already being gone.
fn run_command_best_effort(program: &str, args: &[&str]) {
    if let Err(e) = run_command(program, args) {
        log::warn!("network: best-effort command failed, ignoring: {e}");
    }
}

fn run_command_stdout(program: &str, args: &[&str]) -> Result<String> {
    debug!("network: running {program} {}", args.join(" "));
    let output = Command::new(program).args(args).output().map_err(|e| {
        AgentError::Networking(format!("failed to spawn {program}: {e}"))
    })?;
    if !output.status.success() {
        return Err(AgentError::Networking(format!(
            "{program} {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Schedule removal of both FDB entries primed by `prepare` (the permanent
/// entry and the `master static` entry) 8 seconds out, detached,
/// best-effort.
fn schedule_fdb_removal(tap: String, mac: String, vlan: u16) {
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_secs(8));
        run_command_best_effort(
            "bridge",
            &["fdb", "del", &mac, "dev", &tap, "vlan", &vlan.to_string()],
        );
        run_command_best_effort(
            "bridge",
            &[
                "fdb", "del", &mac, "dev", &tap, "master", "static", "vlan",
                &vlan.to_string(),
            ],
        );
    });
}

/// True when `name` matches the TAP naming convention `^f\d+-`.
fn is_tap_port(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('f') else {
        return false;
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    !digits.is_empty() && rest[digits.len()..].starts_with('-')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognizes_tap_ports() {
        assert!(is_tap_port("f0-vma"));
        assert!(is_tap_port("f12-longname"));
        assert!(!is_tap_port("eth0"));
        assert!(!is_tap_port("br0"));
    }
}
