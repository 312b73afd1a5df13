use crate::error::Result;
use crate::paths::{tap_name, VmPaths};
use crate::spec::Spec;
use crate::state::store::{NetworkSnapshot, TapSnapshot};

use super::{
    is_tap_port, run_command, run_command_best_effort, run_command_stdout, schedule_fdb_removal,
    NetworkingBackend,
};

pub struct LinuxBridgeVlan;

impl LinuxBridgeVlan {
    /// The uplink: explicit `spec.net.uplink`, else the first non-TAP port
    /// enslaved to the bridge.
    fn resolve_uplink(&self, spec: &Spec) -> Result<Option<String>> {
        if let Some(uplink) = &spec.net.uplink {
            return Ok(Some(uplink.clone()));
        }
        let ports = bridge_ports(&spec.net.host_bridge)?;
        Ok(ports.into_iter().find(|p| !is_tap_port(p)))
    }

    fn uplink_mtu(&self, uplink: &str) -> Option<u32> {
        read_mtu(uplink).ok()
    }
}

impl NetworkingBackend for LinuxBridgeVlan {
    fn prepare(&self, spec: &Spec, paths: &VmPaths) -> Result<Vec<String>> {
        let uplink = self.resolve_uplink(spec)?;
        let mtu = uplink.as_deref().and_then(|u| self.uplink_mtu(u));

        let mut taps = Vec::with_capacity(spec.nics.len());
        for nic in &spec.nics {
            if nic.mac.is_empty() {
                continue;
            }
            let tap = tap_name(nic.index, &spec.name);
            let vlan = nic.vlan.unwrap_or(1);

            if !link_exists(&tap)? {
                run_command("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"])?;
            }
            run_command("ip", &["link", "set", &tap, "down"])?;
            run_command("ip", &["link", "set", &tap, "address", &nic.mac])?;
            if let Some(mtu) = mtu {
                run_command("ip", &["link", "set", &tap, "mtu", &mtu.to_string()])?;
            }
            run_command(
                "ip",
                &["link", "set", &tap, "master", &spec.net.host_bridge],
            )?;

            run_command(
                "bridge",
                &["vlan", "del", "dev", &tap, "vid", "1"],
            )?;
            run_command(
                "bridge",
                &[
                    "vlan",
                    "add",
                    "dev",
                    &tap,
                    "vid",
                    &vlan.to_string(),
                    "pvid",
                    "untagged",
                ],
            )?;
            if let Some(uplink) = &uplink {
                if bridge_ports(&spec.net.host_bridge)?.contains(uplink) {
                    run_command(
                        "bridge",
                        &["vlan", "add", "dev", uplink, "vid", &vlan.to_string()],
                    )?;
                }
            }

            let mut port_flag_devs = vec![tap.as_str()];
            if let Some(uplink) = &uplink {
                port_flag_devs.push(uplink.as_str());
            }
            for dev in port_flag_devs {
                run_command(
                    "bridge",
                    &[
                        "link",
                        "set",
                        "dev",
                        dev,
                        "learning",
                        "on",
                        "flood",
                        "on",
                        "mcast_flood",
                        "on",
                        "neigh_suppress",
                        "off",
                        "bcast_flood",
                        "on",
                    ],
                )?;
            }

            run_command("ip", &["link", "set", &tap, "up"])?;

            run_command(
                "bridge",
                &["fdb", "add", &nic.mac, "dev", &tap, "vlan", &vlan.to_string()],
            )?;
            run_command(
                "bridge",
                &[
                    "fdb", "add", &nic.mac, "dev", &tap, "master", "static", "vlan",
                    &vlan.to_string(),
                ],
            )?;
            schedule_fdb_removal(tap.clone(), nic.mac.clone(), vlan);

            taps.push(tap);
        }

        let snapshot = NetworkSnapshot {
            driver: "linux-bridge-vlan".to_string(),
            host_bridge: spec.net.host_bridge.clone(),
            taps: spec
                .nics
                .iter()
                .map(|nic| TapSnapshot {
                    name: tap_name(nic.index, &spec.name),
                    index: nic.index,
                    vlan: nic.vlan,
                })
                .collect(),
        };
        snapshot.save(&paths.network_snapshot_file)?;

        Ok(taps)
    }

    fn teardown(&self, spec: &Spec, paths: &VmPaths) -> Result<()> {
        let mut taps: Vec<TapSnapshot> = spec
            .nics
            .iter()
            .map(|nic| TapSnapshot {
                name: tap_name(nic.index, &spec.name),
                index: nic.index,
                vlan: nic.vlan,
            })
            .collect();
        if let Some(persisted) = NetworkSnapshot::load(&paths.network_snapshot_file)? {
            for t in persisted.taps {
                if !taps.iter().any(|existing| existing.name == t.name) {
                    taps.push(t);
                }
            }
        }

        for tap in &taps {
            run_command_best_effort("ip", &["link", "set", &tap.name, "down"]);
            run_command_best_effort("ip", &["link", "set", &tap.name, "nomaster"]);
            run_command_best_effort("ip", &["tuntap", "del", "dev", &tap.name, "mode", "tap"]);
        }

        let uplink = self.resolve_uplink(spec).unwrap_or_else(|e| {
            log::warn!("teardown for '{}': could not resolve uplink, skipping VID pruning: {e}", spec.name);
            None
        });
        if let Some(uplink) = uplink {
            let remaining_ports = bridge_ports(&spec.net.host_bridge).unwrap_or_default();
            let mut still_referenced = std::collections::HashSet::new();
            for port in &remaining_ports {
                if is_tap_port(port) {
                    if let Ok(vids) = tap_vids(port) {
                        still_referenced.extend(vids);
                    }
                }
            }
            for tap in &taps {
                if let Some(vid) = tap.vlan {
                    if !still_referenced.contains(&vid) {
                        run_command_best_effort(
                            "bridge",
                            &["vlan", "del", "dev", &uplink, "vid", &vid.to_string()],
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

fn link_exists(name: &str) -> Result<bool> {
    match run_command_stdout("ip", &["link", "show", name]) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

fn read_mtu(name: &str) -> Result<u32> {
    let out = run_command_stdout("ip", &["-o", "link", "show", name])?;
    out.split_whitespace()
        .skip_while(|tok| *tok != "mtu")
        .nth(1)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            crate::error::AgentError::Networking(format!("could not read MTU for {name}"))
        })
}

fn bridge_ports(bridge: &str) -> Result<Vec<String>> {
    let out = run_command_stdout("ip", &["-o", "link", "show", "master", bridge])?;
    Ok(out
        .lines()
        .filter_map(|line| {
            line.split(':')
                .nth(1)
                .map(|s| s.trim().split('@').next().unwrap_or("").to_string())
        })
        .filter(|s| !s.is_empty())
        .collect())
}

fn tap_vids(tap: &str) -> Result<Vec<u16>> {
    let out = run_command_stdout("bridge", &["-j", "vlan", "show", "dev", tap])?;
    Ok(out
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|tok| tok.parse::<u16>().ok())
        .collect())
}
