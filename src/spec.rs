//! The canonical per-VM descriptor and its ingestion from an orchestrator
//! payload (§3, §4.2).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{AgentError, Result};

const NAME_RE_ALLOWED: fn(char) -> bool =
    |c: char| c.is_ascii_alphanumeric() || c == '-';

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub index: u32,
    pub mac: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    pub vlan: Option<u16>,
    #[serde(default)]
    pub broadcast_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetSelection {
    pub driver: String,
    pub host_bridge: String,
    pub uplink: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSelection {
    pub driver: String,
    pub volume_group: Option<String>,
    pub thinpool: Option<String>,
    pub size: Option<String>,
    pub volume_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    pub cpus: u32,
    pub mem_mib: u64,
    pub nics: Vec<Nic>,
    pub storage: StorageSelection,
    pub net: NetSelection,
    pub kernel_image_path: String,
    pub rootfs_image_path: String,
    pub boot_args: String,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

impl Spec {
    /// Validate the name against `[A-Za-z0-9-]+`, non-empty.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(NAME_RE_ALLOWED) {
            return Err(AgentError::InvalidArgument(format!(
                "Invalid VM name '{name}'. Only A-Z, a-z, 0-9 and '-' allowed"
            )));
        }
        Ok(())
    }

    /// Ensure at most one NIC per device index.
    pub fn validate_nics(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for nic in &self.nics {
            if !seen.insert(nic.index) {
                return Err(AgentError::InvalidArgument(format!(
                    "duplicate NIC device index {}",
                    nic.index
                )));
            }
        }
        Ok(())
    }

    /// Build a `Spec` from the raw orchestrator JSON payload plus host
    /// defaults, per the field-resolution order in §4.2.
    pub fn from_payload(payload: &Value, config: &Config) -> Result<Self> {
        let name = resolve_name(payload)?;
        Self::validate_name(&name)?;

        let cpus = resolve_cpus(payload);
        let mem_mib = resolve_mem_mib(payload);

        let nics = resolve_nics(payload)?;

        let storage_driver = payload
            .pointer("/storage/driver")
            .and_then(Value::as_str)
            .unwrap_or(&config.defaults.storage.driver)
            .to_string();
        let net_driver = payload
            .pointer("/net/driver")
            .and_then(Value::as_str)
            .unwrap_or(&config.defaults.net.driver)
            .to_string();

        let storage = StorageSelection {
            driver: storage_driver,
            volume_group: payload
                .pointer("/storage/volume_group")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| config.defaults.storage.volume_group.clone()),
            thinpool: payload
                .pointer("/storage/thinpool")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| config.defaults.storage.thinpool.clone()),
            size: payload
                .pointer("/storage/size")
                .and_then(Value::as_str)
                .map(str::to_string),
            volume_file: payload
                .pointer("/storage/volume_file")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        let net = NetSelection {
            driver: net_driver,
            host_bridge: payload
                .pointer("/net/host_bridge")
                .and_then(Value::as_str)
                .unwrap_or(&config.defaults.net.host_bridge)
                .to_string(),
            uplink: payload
                .pointer("/net/uplink")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| config.defaults.net.uplink.clone()),
        };

        let image_name = payload
            .pointer("/externaldetails/virtualmachine/image")
            .and_then(Value::as_str);
        let kernel_name = payload
            .pointer("/externaldetails/virtualmachine/kernel")
            .and_then(Value::as_str);

        let kernel_image_path = match kernel_name {
            Some(n) => config
                .defaults
                .host
                .kernel_dir
                .join(n)
                .to_string_lossy()
                .into_owned(),
            None => config
                .defaults
                .host
                .kernel_dir
                .join("vmlinux.bin")
                .to_string_lossy()
                .into_owned(),
        };
        let rootfs_image_path = match image_name {
            Some(n) => config
                .defaults
                .host
                .image_dir
                .join(n)
                .to_string_lossy()
                .into_owned(),
            None => config
                .defaults
                .host
                .image_dir
                .join("rootfs.ext4")
                .to_string_lossy()
                .into_owned(),
        };

        let boot_args = payload
            .pointer("/boot_args")
            .and_then(Value::as_str)
            .unwrap_or("console=ttyS0 reboot=k panic=1 pci=off")
            .to_string();

        let ssh_public_key = payload
            .pointer("/SSH.PublicKey")
            .and_then(Value::as_str)
            .map(str::to_string);

        let spec = Spec {
            name,
            cpus,
            mem_mib,
            nics,
            storage,
            net,
            kernel_image_path,
            rootfs_image_path,
            boot_args,
            ssh_public_key,
        };
        spec.validate_nics()?;

        if spec.net.driver == "linux-bridge-vlan" || spec.net.driver == "ovs-vlan" {
            for nic in &spec.nics {
                if nic.vlan.is_none() {
                    return Err(AgentError::Networking(format!(
                        "{} requires VLAN for deviceId {}",
                        spec.net.driver, nic.index
                    )));
                }
            }
        }

        Ok(spec)
    }
}

fn resolve_name(payload: &Value) -> Result<String> {
    if let Some(name) = payload.get("vm_name").and_then(Value::as_str) {
        return Ok(name.to_string());
    }
    if let Some(name) = payload
        .pointer("/cloudstack.vm.details/name")
        .and_then(Value::as_str)
    {
        return Ok(name.to_string());
    }
    if let Some(uuid) = payload
        .pointer("/cloudstack.vm.details/uuid")
        .and_then(Value::as_str)
    {
        return Ok(uuid.to_string());
    }
    Err(AgentError::InvalidArgument(
        "Invalid VM name ''. Only A-Z, a-z, 0-9 and '-' allowed".to_string(),
    ))
}

fn resolve_cpus(payload: &Value) -> u32 {
    for pointer in ["/cloudstack.vm.details/cpus", "/cloudstack.vm.details/cpu"] {
        if let Some(n) = payload.pointer(pointer).and_then(Value::as_u64) {
            if n > 0 {
                return n as u32;
            }
        }
    }
    1
}

fn resolve_mem_mib(payload: &Value) -> u64 {
    for pointer in [
        "/cloudstack.vm.details/maxRam",
        "/cloudstack.vm.details/minRam",
        "/cloudstack.vm.details/memory",
    ] {
        if let Some(bytes) = payload.pointer(pointer).and_then(Value::as_u64) {
            if bytes > 0 {
                return (bytes + (1024 * 1024 - 1)) / (1024 * 1024);
            }
        }
    }
    512
}

fn resolve_nics(payload: &Value) -> Result<Vec<Nic>> {
    let Some(raw_nics) = payload
        .pointer("/cloudstack.vm.details/nics")
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };

    let mut nics = Vec::with_capacity(raw_nics.len());
    for raw in raw_nics {
        let index = raw
            .get("deviceId")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let mac = raw
            .get("mac")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let broadcast_uri = raw
            .get("broadcastUri")
            .and_then(Value::as_str)
            .map(str::to_string);
        let explicit_vlan = raw.get("vlan").and_then(Value::as_u64).map(|v| v as u16);
        let vlan = explicit_vlan.or_else(|| {
            broadcast_uri
                .as_deref()
                .and_then(|uri| uri.strip_prefix("vlan://"))
                .and_then(|id| id.parse::<u16>().ok())
        });

        nics.push(Nic {
            index,
            mac,
            ip: raw.get("ip").and_then(Value::as_str).map(str::to_string),
            netmask: raw
                .get("netmask")
                .and_then(Value::as_str)
                .map(str::to_string),
            gateway: raw
                .get("gateway")
                .and_then(Value::as_str)
                .map(str::to_string),
            vlan,
            broadcast_uri,
        });
    }
    Ok(nics)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Defaults, HostDefaults, NetDefaults, StorageDefaults};

    fn test_config() -> Config {
        Config {
            bind_host: "0.0.0.0".into(),
            bind_port: 8080,
            defaults: Defaults {
                host: HostDefaults {
                    firecracker_bin: "/usr/bin/firecracker".into(),
                    conf_dir: "/conf".into(),
                    run_dir: "/run".into(),
                    log_dir: "/log".into(),
                    payload_dir: "/payload".into(),
                    image_dir: "/images".into(),
                    kernel_dir: "/kernels".into(),
                },
                storage: StorageDefaults {
                    driver: "file".into(),
                    volume_dir: Some("/volumes".into()),
                    volume_group: None,
                    thinpool: None,
                },
                net: NetDefaults {
                    driver: "linux-bridge-vlan".into(),
                    host_bridge: "br0".into(),
                    uplink: None,
                },
                console: None,
            },
        }
    }

    #[test]
    fn minimal_vm_resolves_name_cpus_mem_and_vlan() {
        let payload = serde_json::json!({
            "cloudstack.vm.details": {
                "name": "vm-a",
                "cpus": 2,
                "minRam": 1073741824u64,
                "nics": [{"deviceId": 0, "mac": "02:00:00:00:00:01", "broadcastUri": "vlan://42"}]
            },
            "externaldetails": {"virtualmachine": {"image": "ubuntu.img", "kernel": "vmlinux.bin"}}
        });
        let spec = Spec::from_payload(&payload, &test_config()).unwrap();
        assert_eq!(spec.name, "vm-a");
        assert_eq!(spec.cpus, 2);
        assert_eq!(spec.mem_mib, 1024);
        assert_eq!(spec.nics.len(), 1);
        assert_eq!(spec.nics[0].vlan, Some(42));
    }

    #[test]
    fn invalid_name_is_rejected() {
        let payload = serde_json::json!({"vm_name": "bad name!"});
        let err = Spec::from_payload(&payload, &test_config()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid VM name 'bad name!'. Only A-Z, a-z, 0-9 and '-' allowed"
        );
    }

    #[test]
    fn missing_vlan_on_linux_bridge_vlan_is_rejected() {
        let payload = serde_json::json!({
            "cloudstack.vm.details": {
                "name": "vm-c",
                "nics": [{"deviceId": 0, "mac": "02:00:00:00:00:01"}]
            }
        });
        let err = Spec::from_payload(&payload, &test_config()).unwrap_err();
        assert!(matches!(err, AgentError::Networking(_)));
    }

    #[test]
    fn duplicate_nic_index_rejected() {
        let spec = Spec {
            name: "vm-d".into(),
            cpus: 1,
            mem_mib: 512,
            nics: vec![
                Nic {
                    index: 0,
                    mac: "a".into(),
                    ip: None,
                    netmask: None,
                    gateway: None,
                    vlan: Some(1),
                    broadcast_uri: None,
                },
                Nic {
                    index: 0,
                    mac: "b".into(),
                    ip: None,
                    netmask: None,
                    gateway: None,
                    vlan: Some(2),
                    broadcast_uri: None,
                },
            ],
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
            kernel_image_path: "k".into(),
            rootfs_image_path: "r".into(),
            boot_args: "".into(),
            ssh_public_key: None,
        };
        assert!(spec.validate_nics().is_err());
    }
}
