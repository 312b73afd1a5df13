//! Deterministic per-VM artifact path derivation (§4.1).
//!
//! Every path here is a pure function of the configured roots and the VM
//! name — no state is held beyond the `HostDefaults`/`StorageDefaults`
//! reference, matching the "storage/network backends hold no state beyond
//! their Spec reference" ownership rule.

use std::path::PathBuf;

use crate::config::{HostDefaults, StorageDefaults};
use crate::spec::StorageSelection;

#[derive(Debug, Clone)]
pub struct VmPaths {
    pub config_file: PathBuf,
    pub socket_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub volume_file: PathBuf,
    pub lock_file: PathBuf,
    pub network_snapshot_file: PathBuf,
    pub create_payload_file: PathBuf,
}

impl VmPaths {
    /// Derive paths using the config-wide storage defaults, for use before
    /// a VM's own `Spec` is known (e.g. the payload path during create).
    pub fn derive(name: &str, host: &HostDefaults, storage: &StorageDefaults) -> Self {
        Self::derive_with_volume(
            name,
            host,
            volume_path(name, storage.driver.as_str(), storage.volume_group.as_deref(), storage.volume_dir.as_deref()),
        )
    }

    /// Derive paths from a resolved `Spec`'s storage selection, honoring an
    /// explicit `volume_file` override when present.
    pub fn derive_for_spec(name: &str, host: &HostDefaults, storage: &StorageSelection) -> Self {
        let volume_file = storage
            .volume_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                volume_path(name, storage.driver.as_str(), storage.volume_group.as_deref(), None)
            });
        Self::derive_with_volume(name, host, volume_file)
    }

    fn derive_with_volume(name: &str, host: &HostDefaults, volume_file: PathBuf) -> Self {
        Self {
            config_file: host.conf_dir.join(format!("{name}.json")),
            socket_file: host.run_dir.join(format!("{name}.socket")),
            pid_file: host.run_dir.join(format!("{name}.pid")),
            log_file: host.log_dir.join(format!("{name}.log")),
            volume_file,
            lock_file: host.run_dir.join(format!("{name}.lock")),
            network_snapshot_file: host.run_dir.join(format!("network-config-{name}.json")),
            create_payload_file: host.payload_dir.join(format!("create-spec-{name}.json")),
        }
    }
}

/// `/dev/<vg>/vm-<n>` for block-device backends, `<volume_dir>/<n>.img` for
/// file-backed storage.
fn volume_path(
    name: &str,
    driver: &str,
    volume_group: Option<&str>,
    volume_dir: Option<&std::path::Path>,
) -> PathBuf {
    match driver {
        "lvm" | "lvmthin" => {
            let vg = volume_group.unwrap_or("fc-hostd");
            PathBuf::from(format!("/dev/{vg}/vm-{name}"))
        }
        _ => {
            let dir = volume_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/fc-hostd/volumes"));
            dir.join(format!("{name}.img"))
        }
    }
}

/// Stable, collision-free TAP name: `f<index>-<sanitized-vm-name>`, total
/// length <= 15 (the kernel's `IFNAMSIZ - 1`), sanitized name lowercased
/// alphanumeric truncated to 10 chars.
pub fn tap_name(index: u32, vm_name: &str) -> String {
    let sanitized: String = vm_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(10)
        .collect();
    let name = format!("f{index}-{sanitized}");
    debug_assert!(name.len() <= 15);
    name
}

#[cfg(test)]
mod test {
    use super::*;

    fn host() -> HostDefaults {
        HostDefaults {
            firecracker_bin: "/usr/bin/firecracker".into(),
            conf_dir: "/conf".into(),
            run_dir: "/run".into(),
            log_dir: "/log".into(),
            payload_dir: "/payload".into(),
            image_dir: "/image".into(),
            kernel_dir: "/kernel".into(),
        }
    }

    fn storage(driver: &str) -> StorageDefaults {
        StorageDefaults {
            driver: driver.into(),
            volume_dir: Some("/volumes".into()),
            volume_group: Some("vg0".into()),
            thinpool: None,
        }
    }

    #[test]
    fn artifact_paths_are_pairwise_distinct_and_under_configured_roots() {
        let p = VmPaths::derive("vm-a", &host(), &storage("file"));
        let all = [
            &p.config_file,
            &p.socket_file,
            &p.pid_file,
            &p.log_file,
            &p.volume_file,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
        assert!(p.config_file.starts_with("/conf"));
        assert!(p.socket_file.starts_with("/run"));
        assert!(p.pid_file.starts_with("/run"));
        assert!(p.log_file.starts_with("/log"));
        assert!(p.volume_file.starts_with("/volumes"));
    }

    #[test]
    fn lvm_volume_path_is_block_device() {
        let p = VmPaths::derive("vm-b", &host(), &storage("lvm"));
        assert_eq!(p.volume_file, PathBuf::from("/dev/vg0/vm-vm-b"));
    }

    #[test]
    fn injective_in_name() {
        let p1 = VmPaths::derive("vm-a", &host(), &storage("file"));
        let p2 = VmPaths::derive("vm-b", &host(), &storage("file"));
        assert_ne!(p1.config_file, p2.config_file);
        assert_ne!(p1.volume_file, p2.volume_file);
    }

    #[test]
    fn tap_name_respects_length_and_charset() {
        let n = tap_name(3, "Some-VM_Name-With-Very-Long-Title");
        assert!(n.len() <= 15);
        assert!(n.starts_with("f3-"));
        assert!(n.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '-'));
    }

    #[test]
    fn tap_name_injective_in_index_and_name() {
        assert_ne!(tap_name(0, "vm-a"), tap_name(1, "vm-a"));
        assert_ne!(tap_name(0, "vm-a"), tap_name(0, "vm-b"));
    }
}
