use serde::{Deserialize, Serialize};

/// Defines a network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkInterface {
    /// guest mac
    #[serde(rename = "guest_mac", skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,

    /// Host level path for the guest network interface
    /// Required: true
    #[serde(rename = "host_dev_name")]
    pub host_dev_name: String,

    /// iface id
    /// Required: true
    #[serde(rename = "iface_id")]
    pub iface_id: String,
}
