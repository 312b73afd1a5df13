use serde::{Deserialize, Serialize};

use super::*;

/// The on-disk Firecracker configuration document the config writer
/// emits: boot source, a single root drive, machine config, and the
/// VM's network interfaces in index order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullVmConfiguration {
    #[serde(rename = "boot-source")]
    pub boot_source: boot_source::BootSource,

    #[serde(rename = "drives")]
    pub drives: Vec<drive::Drive>,

    #[serde(rename = "machine-config")]
    pub machine_config: machine_configuration::MachineConfiguration,

    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<network_interface::NetworkInterface>,

    #[serde(rename = "logger", skip_serializing_if = "Option::is_none")]
    pub logger: Option<logger::Logger>,
}
