//! Serializes a `Spec` plus a storage backend's resolved device path into
//! Firecracker's on-disk JSON configuration document (§4.5).

use std::path::Path;

use crate::error::{AgentError, Result};
use crate::models::{
    BootSource, CacheType, Drive, FullVmConfiguration, IoEngine, LogLevel, Logger,
    MachineConfiguration, NetworkInterface,
};
use crate::paths::{tap_name, VmPaths};
use crate::spec::Spec;

/// Build the document Firecracker will read via `--config-file`.
pub fn build_config(spec: &Spec, device_path: &str, paths: &VmPaths) -> Result<FullVmConfiguration> {
    if spec.kernel_image_path.is_empty() {
        return Err(AgentError::InvalidArgument(
            "kernel image path is empty".to_string(),
        ));
    }
    if !Path::new(&spec.kernel_image_path).exists() {
        return Err(AgentError::NotFound(format!(
            "kernel image not found at {}",
            spec.kernel_image_path
        )));
    }

    let boot_source = BootSource {
        kernel_image_path: spec.kernel_image_path.clone(),
        boot_args: Some(spec.boot_args.clone()),
        initrd_path: None,
    };

    let root_drive = Drive {
        drive_id: "rootfs".to_string(),
        partuuid: None,
        is_root_device: true,
        cache_type: Some(CacheType::Unsafe),
        is_read_only: false,
        path_on_host: device_path.to_string(),
        io_engine: Some(IoEngine::Sync),
        socket: None,
    };

    let machine_config = MachineConfiguration {
        smt: false,
        mem_size_mib: spec.mem_mib as isize,
        track_dirty_pages: false,
        vcpu_count: spec.cpus as isize,
    };

    let mut nics_sorted = spec.nics.clone();
    nics_sorted.sort_by_key(|n| n.index);
    let network_interfaces = nics_sorted
        .iter()
        .map(|nic| NetworkInterface {
            guest_mac: if nic.mac.is_empty() {
                None
            } else {
                Some(nic.mac.clone())
            },
            host_dev_name: tap_name(nic.index, &spec.name),
            iface_id: format!("eth{}", nic.index),
        })
        .collect();

    let logger = Logger {
        level: Some(LogLevel::Info),
        log_path: paths.log_file.to_string_lossy().into_owned(),
        show_level: Some(true),
        show_log_origin: Some(false),
        module: None,
    };

    Ok(FullVmConfiguration {
        boot_source,
        drives: vec![root_drive],
        machine_config,
        network_interfaces,
        logger: Some(logger),
    })
}

/// Write the config document to `paths.config_file`.
pub fn write_config(spec: &Spec, device_path: &str, paths: &VmPaths) -> Result<()> {
    let config = build_config(spec, device_path, paths)?;
    let json = serde_json::to_string_pretty(&config)?;
    crate::state::store::atomic_write(&paths.config_file, json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{HostDefaults, StorageDefaults};
    use crate::spec::{Nic, NetSelection, StorageSelection};

    fn spec_with_kernel(kernel_path: &str) -> Spec {
        Spec {
            name: "vm-a".into(),
            cpus: 2,
            mem_mib: 1024,
            nics: vec![Nic {
                index: 0,
                mac: "02:00:00:00:00:01".into(),
                ip: None,
                netmask: None,
                gateway: None,
                vlan: Some(42),
                broadcast_uri: Some("vlan://42".into()),
            }],
            storage: StorageSelection {
                driver: "file".into(),
                volume_group: None,
                thinpool: None,
                size: None,
                volume_file: None,
            },
            net: NetSelection {
                driver: "linux-bridge-vlan".into(),
                host_bridge: "br0".into(),
                uplink: None,
            },
            kernel_image_path: kernel_path.to_string(),
            rootfs_image_path: "/images/rootfs.ext4".into(),
            boot_args: "console=ttyS0".into(),
            ssh_public_key: None,
        }
    }

    #[test]
    fn builds_expected_shape_for_minimal_vm() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux.bin");
        std::fs::write(&kernel, b"fake").unwrap();
        let spec = spec_with_kernel(kernel.to_str().unwrap());
        let host = HostDefaults {
            firecracker_bin: "/usr/bin/firecracker".into(),
            conf_dir: dir.path().join("conf"),
            run_dir: dir.path().join("run"),
            log_dir: dir.path().join("log"),
            payload_dir: dir.path().join("payload"),
            image_dir: dir.path().join("image"),
            kernel_dir: dir.path().join("kernel"),
        };
        let storage = StorageDefaults {
            driver: "file".into(),
            volume_dir: Some(dir.path().join("volumes")),
            volume_group: None,
            thinpool: None,
        };
        let paths = VmPaths::derive("vm-a", &host, &storage);

        let config = build_config(&spec, "/volumes/vm-a.img", &paths).unwrap();
        assert_eq!(config.machine_config.vcpu_count, 2);
        assert_eq!(config.machine_config.mem_size_mib, 1024);
        assert_eq!(config.network_interfaces.len(), 1);
        assert_eq!(config.network_interfaces[0].iface_id, "eth0");
        assert_eq!(config.network_interfaces[0].host_dev_name, "f0-vma");
        assert_eq!(
            config.network_interfaces[0].guest_mac.as_deref(),
            Some("02:00:00:00:00:01")
        );
        assert_eq!(config.drives[0].path_on_host, "/volumes/vm-a.img");
        assert!(config.drives[0].is_root_device);
    }

    #[test]
    fn missing_kernel_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_with_kernel(dir.path().join("absent.bin").to_str().unwrap());
        let host = HostDefaults {
            firecracker_bin: "/usr/bin/firecracker".into(),
            conf_dir: dir.path().join("conf"),
            run_dir: dir.path().join("run"),
            log_dir: dir.path().join("log"),
            payload_dir: dir.path().join("payload"),
            image_dir: dir.path().join("image"),
            kernel_dir: dir.path().join("kernel"),
        };
        let storage = StorageDefaults {
            driver: "file".into(),
            volume_dir: Some(dir.path().join("volumes")),
            volume_group: None,
            thinpool: None,
        };
        let paths = VmPaths::derive("vm-a", &host, &storage);
        let err = build_config(&spec, "/volumes/vm-a.img", &paths).unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
