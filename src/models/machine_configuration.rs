use serde::{Deserialize, Serialize};

/// Machine configuration: vCPU count and memory size, fixed `smt=false`
/// and `track_dirty_pages=false` for this agent (hyperthreading toggles
/// and dirty-page tracking are both snapshot/performance knobs this core
/// never exposes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineConfiguration {
    /// Flag for enabling/disabling Hyperthreading.
    /// Required: true
    #[serde(rename = "smt")]
    pub smt: bool,

    /// Memory size of VM, in MiB.
    /// Required: true
    #[serde(rename = "mem_size_mib")]
    pub mem_size_mib: isize,

    /// Enable dirty page tracking. Only meaningful for snapshotting,
    /// which this agent does not support; always false.
    #[serde(rename = "track_dirty_pages")]
    pub track_dirty_pages: bool,

    /// Number of vCPUs (either 1 or an even number)
    /// Required: true
    /// Maximum: 32
    /// Minimum: 1
    #[serde(rename = "vcpu_count")]
    pub vcpu_count: isize,
}
