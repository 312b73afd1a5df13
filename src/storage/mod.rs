//! Pluggable storage backends (§4.3): raw file copy, LVM thick volumes, and
//! LVM thin snapshots from a shared base.

mod file;
mod lvm;
mod lvmthin;

use log::debug;
use std::path::Path;
use std::process::Command;

use crate::config::StorageDefaults;
use crate::error::{AgentError, Result};
use crate::spec::Spec;

pub use file::FileBackend;
pub use lvm::LvmBackend;
pub use lvmthin::LvmThinBackend;

/// Materializes and tears down the block device backing a VM's root drive.
pub trait StorageBackend {
    /// Idempotently materialize the volume, tolerating partial prior state.
    fn prepare(&self, spec: &Spec) -> Result<()>;

    /// The host-visible path placed into the hypervisor config as `path_on_host`.
    fn device_path(&self, spec: &Spec) -> String;

    /// Remove the volume. An absent volume is success.
    fn delete(&self, spec: &Spec) -> Result<()>;

    /// `delete` plus swallow recoverable errors, logging them instead.
    fn cleanup(&self, spec: &Spec) {
        if let Err(e) = self.delete(spec) {
            log::warn!("storage cleanup for '{}' failed, ignoring: {e}", spec.name);
        }
    }
}

/// Select a backend by `storage.driver`.
pub fn backend_for(defaults: &StorageDefaults, paths: &crate::paths::VmPaths) -> Box<dyn StorageBackend> {
    match defaults.driver.as_str() {
        "lvm" => Box::new(LvmBackend::new(defaults.clone(), paths.volume_file.clone())),
        "lvmthin" => Box::new(LvmThinBackend::new(defaults.clone(), paths.volume_file.clone())),
        _ => Box::new(FileBackend::new(paths.volume_file.clone())),
    }
}

/// Run a host command, logging the invocation and mapping non-zero exit or
/// spawn failure to `AgentError::Storage`.
fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!("storage: running {program} {}", args.join(" "));
    let status = Command::new(program).args(args).status().map_err(|e| {
        AgentError::Storage(format!("failed to spawn {program}: {e}"))
    })?;
    if !status.success() {
        return Err(AgentError::Storage(format!(
            "{program} {} exited with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

/// Run a host command and return its captured stdout, for introspection
/// (`file`, `lvs`) rather than side-effecting calls.
fn run_command_stdout(program: &str, args: &[&str]) -> Result<String> {
    debug!("storage: running {program} {}", args.join(" "));
    let output = Command::new(program).args(args).output().map_err(|e| {
        AgentError::Storage(format!("failed to spawn {program}: {e}"))
    })?;
    if !output.status.success() {
        return Err(AgentError::Storage(format!(
            "{program} {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// True when `file(1)` recognizes `path` as a raw filesystem image rather
/// than an already-partitioned/filesystem-bearing disk image — used to
/// decide whether `mkfs` should run before the image is copied onto the LV.
fn looks_like_raw_fs_image(path: &Path) -> Result<bool> {
    let out = run_command_stdout("file", &["-b", &path.to_string_lossy()])?;
    let lower = out.to_ascii_lowercase();
    Ok(lower.contains("filesystem") && !lower.contains("partition") && !lower.contains("boot sector"))
}
