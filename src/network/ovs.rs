use std::collections::HashSet;

use crate::error::{AgentError, Result};
use crate::paths::{tap_name, VmPaths};
use crate::spec::Spec;
use crate::state::store::{NetworkSnapshot, TapSnapshot};

use super::{run_command, run_command_best_effort, run_command_stdout, NetworkingBackend};

pub struct OvsVlan;

impl NetworkingBackend for OvsVlan {
    fn prepare(&self, spec: &Spec, paths: &VmPaths) -> Result<Vec<String>> {
        let uplink = spec.net.uplink.as_deref().ok_or_else(|| {
            AgentError::Networking("ovs-vlan requires an explicit uplink".to_string())
        })?;

        run_command(
            "ovs-vsctl",
            &["--may-exist", "add-br", &spec.net.host_bridge],
        )?;
        run_command(
            "ovs-vsctl",
            &["--may-exist", "add-port", &spec.net.host_bridge, uplink],
        )?;

        let mut taps = Vec::with_capacity(spec.nics.len());
        let mut vids = HashSet::new();
        for nic in &spec.nics {
            if nic.mac.is_empty() {
                continue;
            }
            let tap = tap_name(nic.index, &spec.name);
            let vlan = nic.vlan.unwrap_or(1);
            vids.insert(vlan);

            if run_command_stdout("ip", &["link", "show", &tap]).is_err() {
                run_command("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"])?;
            }
            run_command("ip", &["link", "set", &tap, "address", &nic.mac])?;
            run_command("ip", &["link", "set", &tap, "up"])?;

            run_command(
                "ovs-vsctl",
                &["--may-exist", "add-port", &spec.net.host_bridge, &tap],
            )?;
            run_command("ovs-vsctl", &["set", "port", &tap, &format!("tag={vlan}")])?;
            run_command(
                "ovs-vsctl",
                &["set", "port", &tap, "vlan_mode=access"],
            )?;
            run_command(
                "ovs-vsctl",
                &[
                    "set",
                    "port",
                    &tap,
                    &format!("external-ids:fc_vm_name={}", spec.name),
                    &format!("external-ids:fc_device_id={}", nic.index),
                ],
            )?;

            taps.push(tap);
        }

        let all_vids = access_port_vids(&spec.net.host_bridge, uplink)?
            .into_iter()
            .chain(vids.into_iter())
            .collect::<HashSet<_>>();
        run_command("ovs-vsctl", &["remove", "port", uplink, "tag", "0"]).ok();
        run_command("ovs-vsctl", &["set", "port", uplink, "vlan_mode=trunk"])?;
        let trunks = format_trunks(&all_vids);
        run_command("ovs-vsctl", &["set", "port", uplink, &format!("trunks={trunks}")])?;

        let snapshot = NetworkSnapshot {
            driver: "ovs-vlan".to_string(),
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
            run_command_best_effort(
                "ovs-vsctl",
                &["--if-exists", "del-port", &spec.net.host_bridge, &tap.name],
            );
            run_command_best_effort("ip", &["tuntap", "del", "dev", &tap.name, "mode", "tap"]);
        }

        if let Some(uplink) = &spec.net.uplink {
            if let Ok(remaining) = access_port_vids(&spec.net.host_bridge, uplink) {
                let trunks = format_trunks(&remaining);
                run_command_best_effort(
                    "ovs-vsctl",
                    &["set", "port", uplink, &format!("trunks={trunks}")],
                );
            }
        }

        Ok(())
    }
}

/// VIDs in use by every other access port on the bridge (excluding `uplink`).
fn access_port_vids(bridge: &str, uplink: &str) -> Result<HashSet<u16>> {
    let ports = run_command_stdout("ovs-vsctl", &["list-ports", bridge])?;
    let mut vids = HashSet::new();
    for port in ports.lines().map(str::trim).filter(|p| !p.is_empty() && *p != uplink) {
        if let Ok(tag) = run_command_stdout("ovs-vsctl", &["get", "port", port, "tag"]) {
            if let Ok(vid) = tag.trim().parse::<u16>() {
                vids.insert(vid);
            }
        }
    }
    Ok(vids)
}

fn format_trunks(vids: &HashSet<u16>) -> String {
    let mut sorted: Vec<_> = vids.iter().copied().collect();
    sorted.sort_unstable();
    format!(
        "[{}]",
        sorted
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    )
}
