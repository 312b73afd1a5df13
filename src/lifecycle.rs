//! The top-level per-VM state machine (§4.8): `create`, `start`, `stop`,
//! `reboot`, `delete`, `recover`, plus agent-startup reconciliation.
//!
//! `create`'s rollback stack is a direct descendant of the teacher's
//! `raii::RollbackStack`: a LIFO `Vec` of pending undo actions, unwound on
//! `Drop` so an early `?` return still rolls back everything pushed so far.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::network::{self, NetworkingBackend};
use crate::paths::VmPaths;
use crate::process::supervisor::{ProcessSupervisor, VmStatus};
use crate::spec::Spec;
use crate::state::store::{CreatePayload, RunningSet};
use crate::{firecracker, storage};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

enum Rollback {
    StopProcess(String, VmPaths),
    TeardownNetworking(Spec, VmPaths),
    CleanupStorage(Spec, VmPaths),
}

#[derive(Default)]
struct RollbackStack(Vec<Rollback>);

impl RollbackStack {
    fn push(&mut self, step: Rollback) {
        self.0.push(step);
    }

    fn disarm(&mut self) {
        self.0.clear();
    }
}

impl Drop for RollbackStack {
    fn drop(&mut self) {
        while let Some(step) = self.0.pop() {
            match step {
                Rollback::StopProcess(vm_name, paths) => {
                    info!("rollback: stopping '{vm_name}'");
                    if let Err(e) = ProcessSupervisor.stop(&vm_name, &paths, DEFAULT_STOP_TIMEOUT) {
                        warn!("rollback: stop '{vm_name}' failed, ignoring: {e}");
                    }
                }
                Rollback::TeardownNetworking(spec, paths) => {
                    info!("rollback: tearing down networking for '{}'", spec.name);
                    let backend = network::backend_for(&net_defaults_from_spec(&spec));
                    if let Err(e) = backend.teardown(&spec, &paths) {
                        warn!("rollback: networking teardown for '{}' failed, ignoring: {e}", spec.name);
                    }
                }
                Rollback::CleanupStorage(spec, paths) => {
                    info!("rollback: cleaning up storage for '{}'", spec.name);
                    let backend = storage::backend_for(&storage_defaults_from_spec(&spec), &paths);
                    backend.cleanup(&spec);
                }
            }
        }
    }
}

fn net_defaults_from_spec(spec: &Spec) -> crate::config::NetDefaults {
    crate::config::NetDefaults {
        driver: spec.net.driver.clone(),
        host_bridge: spec.net.host_bridge.clone(),
        uplink: spec.net.uplink.clone(),
    }
}

fn storage_defaults_from_spec(spec: &Spec) -> crate::config::StorageDefaults {
    crate::config::StorageDefaults {
        driver: spec.storage.driver.clone(),
        volume_dir: None,
        volume_group: spec.storage.volume_group.clone(),
        thinpool: spec.storage.thinpool.clone(),
    }
}

/// Guess a VM name from the payload without validating it, purely so the
/// raw payload can be persisted for debuggability before parsing can fail.
fn guess_name(payload: &Value) -> String {
    payload
        .get("vm_name")
        .and_then(Value::as_str)
        .or_else(|| payload.pointer("/cloudstack.vm.details/name").and_then(Value::as_str))
        .or_else(|| payload.pointer("/cloudstack.vm.details/uuid").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string()
}

/// `create`: persist payload, parse+validate, storage, SSH key injection,
/// networking, config write, process start. Any failure rolls back
/// everything prior, in reverse order.
///
/// `raw_payload` is persisted verbatim (see `CreatePayload`); `payload` is
/// parsed once by the caller and reused for name-guessing and validation.
pub fn create(config: &Config, raw_payload: &[u8]) -> Result<Spec> {
    let payload: Value = serde_json::from_slice(raw_payload)?;
    let guessed = guess_name(&payload);
    let early_payload_path = config
        .defaults
        .host
        .payload_dir
        .join(format!("create-spec-{guessed}.json"));
    CreatePayload(raw_payload.to_vec()).save(&early_payload_path)?;

    let spec = Spec::from_payload(&payload, config)?;
    let paths = VmPaths::derive_for_spec(&spec.name, &config.defaults.host, &spec.storage);

    if early_payload_path != paths.create_payload_file {
        CreatePayload(raw_payload.to_vec()).save(&paths.create_payload_file)?;
        let _ = std::fs::remove_file(&early_payload_path);
    }

    let mut rollback = RollbackStack::default();

    let storage_backend = storage::backend_for(&storage_defaults_from_spec(&spec), &paths);
    storage_backend.prepare(&spec)?;
    rollback.push(Rollback::CleanupStorage(spec.clone(), paths.clone()));

    if let Some(public_key) = &spec.ssh_public_key {
        inject_ssh_key(storage_backend.as_ref(), &spec, public_key);
    }

    let net_backend = network::backend_for(&net_defaults_from_spec(&spec));
    net_backend.prepare(&spec, &paths)?;
    rollback.push(Rollback::TeardownNetworking(spec.clone(), paths.clone()));

    let device_path = storage_backend.device_path(&spec);
    firecracker::config::write_config(&spec, &device_path, &paths)?;

    ProcessSupervisor.start(&spec.name, &config.defaults.host, &paths)?;
    rollback.push(Rollback::StopProcess(spec.name.clone(), paths.clone()));

    rollback.disarm();
    Ok(spec)
}

/// Best-effort SSH public-key injection (§4.8 step 4): mount the prepared
/// volume, append the key to `/root/.ssh/authorized_keys`, fix permissions,
/// then unmount and tear down any loop device on every exit path. Never
/// fails `create` — a failed injection is only logged.
fn inject_ssh_key(storage_backend: &dyn storage::StorageBackend, spec: &Spec, public_key: &str) {
    let device = storage_backend.device_path(spec);

    let mount_dir = match tempfile::Builder::new().prefix("fc-mnt-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            warn!("ssh key injection for '{}': failed to create mount point: {e}", spec.name);
            return;
        }
    };
    let mount_point = mount_dir.path().to_string_lossy().into_owned();

    let is_block_device = std::fs::metadata(&device)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);

    let mut loop_dev: Option<String> = None;
    let mounted = if is_block_device {
        run_mount(&[&device, &mount_point])
    } else if run_mount(&["-o", "loop", &device, &mount_point]) {
        true
    } else {
        match std::process::Command::new("losetup")
            .args(["--show", "-f", &device])
            .output()
        {
            Ok(out) if out.status.success() => {
                let dev = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if run_mount(&[&dev, &mount_point]) {
                    loop_dev = Some(dev);
                    true
                } else {
                    let _ = std::process::Command::new("losetup").args(["-d", &dev]).status();
                    false
                }
            }
            _ => false,
        }
    };

    if mounted {
        if let Err(e) = write_authorized_key(mount_dir.path(), public_key) {
            warn!("ssh key injection for '{}': {e}", spec.name);
        } else {
            info!("injected SSH key into volume for '{}'", spec.name);
        }
        let _ = std::process::Command::new("umount").arg(&mount_point).status();
    } else {
        warn!("ssh key injection for '{}': could not mount {device}", spec.name);
    }

    if let Some(dev) = loop_dev {
        let _ = std::process::Command::new("losetup").args(["-d", &dev]).status();
    }
}

fn run_mount(args: &[&str]) -> bool {
    std::process::Command::new("mount")
        .args(args)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write_authorized_key(mount_root: &Path, public_key: &str) -> Result<()> {
    let ssh_dir = mount_root.join("root").join(".ssh");
    std::fs::create_dir_all(&ssh_dir)?;
    let auth_file = ssh_dir.join("authorized_keys");

    let mut contents = std::fs::read_to_string(&auth_file).unwrap_or_default();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(public_key.trim());
    contents.push('\n');
    std::fs::write(&auth_file, contents)?;

    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;
    std::fs::set_permissions(&auth_file, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// `start`: (re)write the hypervisor config and launch the process for an
/// already-`create`d VM, e.g. after a `recover`.
pub fn start(config: &Config, spec: &Spec) -> Result<()> {
    let paths = VmPaths::derive_for_spec(&spec.name, &config.defaults.host, &spec.storage);
    let storage_backend = storage::backend_for(&storage_defaults_from_spec(spec), &paths);
    let device_path = storage_backend.device_path(spec);
    firecracker::config::write_config(spec, &device_path, &paths)?;
    ProcessSupervisor.start(&spec.name, &config.defaults.host, &paths)?;
    Ok(())
}

/// `stop`: idempotent; a missing VM is success.
pub fn stop(config: &Config, vm_name: &str, timeout: Option<Duration>) -> Result<()> {
    let paths = default_paths(config, vm_name);
    ProcessSupervisor.stop(vm_name, &paths, timeout.unwrap_or(DEFAULT_STOP_TIMEOUT))
}

/// `reboot`: stop, pause briefly, start.
pub fn reboot(config: &Config, spec: &Spec, timeout: Option<Duration>) -> Result<()> {
    stop(config, &spec.name, timeout)?;
    std::thread::sleep(Duration::from_secs(2));
    start(config, spec)
}

/// `delete`: stop, teardown networking (best-effort), cleanup storage
/// (propagates), unlink config and log files.
pub fn delete(config: &Config, spec: &Spec) -> Result<()> {
    let paths = VmPaths::derive_for_spec(&spec.name, &config.defaults.host, &spec.storage);
    ProcessSupervisor.stop(&spec.name, &paths, DEFAULT_STOP_TIMEOUT)?;

    let net_backend = network::backend_for(&net_defaults_from_spec(spec));
    if let Err(e) = net_backend.teardown(spec, &paths) {
        warn!("delete '{}': networking teardown failed, ignoring: {e}", spec.name);
    }

    let storage_backend = storage::backend_for(&storage_defaults_from_spec(spec), &paths);
    storage_backend.delete(spec)?;

    for path in [
        &paths.config_file,
        &paths.log_file,
        &paths.network_snapshot_file,
        &paths.create_payload_file,
    ] {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// `recover`: re-run networking preparation and refresh the snapshot, for
/// either an agent restart (no-op dataplane) or a host restart (re-program
/// TAPs/VLANs before the caller restarts the hypervisor).
pub fn recover(config: &Config, spec: &Spec) -> Result<()> {
    let paths = VmPaths::derive_for_spec(&spec.name, &config.defaults.host, &spec.storage);
    let net_backend = network::backend_for(&net_defaults_from_spec(spec));
    net_backend.prepare(spec, &paths)?;
    Ok(())
}

/// `status`: never raises. Unreachable hypervisor or unreadable pid file
/// are both treated as `poweroff`.
pub fn status(config: &Config, vm_name: &str) -> VmStatus {
    let paths = default_paths(config, vm_name);
    ProcessSupervisor.status(vm_name, &config.defaults.host, &paths)
}

/// Persist the set of currently-running VMs, for later startup
/// reconciliation (`save-states`).
pub fn save_states(config: &Config, vm_names: &[String]) -> Result<()> {
    let mut set = RunningSet::default();
    for name in vm_names {
        let paths = default_paths(config, name);
        if let Some(pid) = std::fs::read_to_string(&paths.pid_file)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
        {
            set.insert(name, pid, chrono::Utc::now());
        }
    }
    let path = config.defaults.host.run_dir.join("vm-states.json");
    set.save(&path)
}

/// Enumerate configured VMs (every `*.json` under `conf_dir` other than
/// the network-snapshot/running-set files) by scanning the config
/// directory.
pub fn list_vms(config: &Config) -> Result<Vec<String>> {
    let dir = &config.defaults.host.conf_dir;
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if stem == "vm-states" || stem.starts_with("network-config-") {
                continue;
            }
            names.push(stem.to_string());
        }
    }
    Ok(names)
}

/// Classify the agent's own startup as a **host restart** (none of the
/// previously-saved VMs are currently running — re-program networking and
/// re-start each) or an **agent restart** (some are still running — only
/// refresh their networking).
pub fn startup_reconciliation(config: &Config, specs_by_name: &std::collections::HashMap<String, Spec>) -> Result<()> {
    let running_set_path = config.defaults.host.run_dir.join("vm-states.json");
    let saved = RunningSet::load(&running_set_path)?;

    let any_saved_running = saved
        .vms
        .keys()
        .any(|name| matches!(status(config, name), VmStatus::PowerOn));

    for name in list_vms(config)? {
        let Some(spec) = specs_by_name.get(&name) else {
            warn!("startup reconciliation: no spec available for '{name}', skipping");
            continue;
        };
        if any_saved_running {
            if let Err(e) = recover(config, spec) {
                warn!("startup reconciliation (agent restart) for '{name}' failed: {e}");
            }
        } else {
            info!("startup reconciliation: treating as host restart for '{name}'");
            if let Err(e) = recover(config, spec).and_then(|_| start(config, spec)) {
                warn!("startup reconciliation (host restart) for '{name}' failed: {e}");
            }
        }
    }
    Ok(())
}

fn default_paths(config: &Config, vm_name: &str) -> VmPaths {
    VmPaths::derive(vm_name, &config.defaults.host, &config.defaults.storage)
}

/// Load the persisted create payload for `vm_name` and re-resolve it into
/// a `Spec`, for operations (`start`, `stop`, `recover`) that only receive
/// a VM name over HTTP.
pub fn load_spec(config: &Config, vm_name: &str) -> Result<Spec> {
    let payload_path = config
        .defaults
        .host
        .payload_dir
        .join(format!("create-spec-{vm_name}.json"));
    let payload = CreatePayload::load(&payload_path)?
        .ok_or_else(|| AgentError::NotFound(format!("no create payload for '{vm_name}'")))?;
    Spec::from_payload(&payload.parsed()?, config)
}

pub fn inspect(config: &Config, vm_name: &str) -> Result<Value> {
    let paths = default_paths(config, vm_name);
    if !paths.config_file.exists() {
        return Err(AgentError::NotFound(format!("VM '{vm_name}' not found")));
    }
    let fc_config: Value = serde_json::from_slice(&std::fs::read(&paths.config_file)?)?;
    let network: Option<Value> = crate::state::store::read_json(&paths.network_snapshot_file)?;
    let payload = CreatePayload::load(&paths.create_payload_file)?
        .map(|p| p.redacted())
        .transpose()?;

    Ok(serde_json::json!({
        "status": "success",
        "vm_name": vm_name,
        "config": fc_config,
        "network": network,
        "payload": payload,
        "paths": paths_to_json(&paths),
    }))
}

fn paths_to_json(paths: &VmPaths) -> Value {
    serde_json::json!({
        "config_file": path_str(&paths.config_file),
        "socket_file": path_str(&paths.socket_file),
        "pid_file": path_str(&paths.pid_file),
        "log_file": path_str(&paths.log_file),
        "volume_file": path_str(&paths.volume_file),
        "network_snapshot_file": path_str(&paths.network_snapshot_file),
    })
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}
