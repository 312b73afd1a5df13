pub mod boot_source;
pub mod drive;
pub mod firecracker_version;
pub mod full_vm_configuration;
pub mod instance_action_info;
pub mod logger;
pub mod machine_configuration;
pub mod network_interface;

pub use boot_source::BootSource;
pub use drive::{CacheType, Drive, IoEngine};
pub use firecracker_version::FirecrackerVersion;
pub use full_vm_configuration::FullVmConfiguration;
pub use instance_action_info::{ActionType, InstanceActionInfo};
pub use logger::{LogLevel, Logger};
pub use machine_configuration::MachineConfiguration;
pub use network_interface::NetworkInterface;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Empty {
    empty: u8,
}
