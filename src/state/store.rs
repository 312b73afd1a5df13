//! Atomic read/write helpers for the three state-store artifacts.
//!
//! Every write lands in a `tempfile::NamedTempFile` created alongside the
//! target path and is then `persist`ed (atomic rename) over it, so a reader
//! racing a writer always sees either the old or the new content, never a
//! partial one. Readers treat a missing file as "no snapshot yet", not an
//! error.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Keys whose values are never echoed back verbatim by the inspect handler.
const REDACTED_KEYS: &[&str] = &["password", "secret", "token", "key", "vncpassword"];
const REDACTED_PLACEHOLDER: &str = "***redacted***";

/// Write `bytes` to `path` atomically via a sibling temp file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        AgentError::Internal(format!("{} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path)
        .map_err(|e| AgentError::Internal(format!("atomic rename onto {}: {}", path.display(), e)))?;
    Ok(())
}

/// Read and parse `path` as JSON. A missing file yields `Ok(None)`, matching
/// the "missing files are not an error on read" rule.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// A single VLAN-tagged TAP as last programmed for one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TapSnapshot {
    pub name: String,
    pub index: u32,
    pub vlan: Option<u16>,
}

/// The dataplane state a networking backend last produced for a VM, so
/// `teardown` can find its TAPs without re-deriving them from the spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub driver: String,
    pub host_bridge: String,
    pub taps: Vec<TapSnapshot>,
}

impl NetworkSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

/// The verbatim create payload, persisted byte-for-byte as submitted.
///
/// Holds the raw request bytes rather than a re-parsed `Value`: without the
/// `preserve_order` feature, `serde_json::Map` is a `BTreeMap`, so
/// reserializing a parsed `Value` re-sorts object keys and reflows
/// whitespace. Keeping the original bytes is the only way to honor the
/// "persisted verbatim" rule.
#[derive(Debug, Clone)]
pub struct CreatePayload(pub Vec<u8>);

impl CreatePayload {
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.0)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(CreatePayload(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse the stored bytes as JSON, for callers that need the value
    /// rather than the verbatim bytes (e.g. re-resolving a `Spec`).
    pub fn parsed(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    /// The payload with every redacted key's value replaced, for the
    /// inspect HTTP handler. The on-disk copy is never touched.
    pub fn redacted(&self) -> Result<Value> {
        Ok(redact_payload(&self.parsed()?))
    }
}

/// Recursively replace the value of any object key matching the redaction
/// rule (`password`/`secret`/`token`/`key`/`vncpassword` case-insensitive,
/// or the exact key `SSH.PublicKey`) with the placeholder string.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if k == "SSH.PublicKey" || REDACTED_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                    out.insert(k.clone(), Value::String(REDACTED_PLACEHOLDER.to_string()));
                } else {
                    out.insert(k.clone(), redact_payload(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}

/// One VM's entry in the running-set snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRunState {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
}

/// The host-wide running-set snapshot at `<run_dir>/vm-states.json`, used
/// on agent restart to decide which VMs are still owned by a live
/// Firecracker process versus which need `recover`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningSet {
    pub vms: HashMap<String, VmRunState>,
}

impl RunningSet {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())
    }

    pub fn insert(&mut self, vm_name: &str, pid: i32, started_at: DateTime<Utc>) {
        self.vms
            .insert(vm_name.to_string(), VmRunState { pid, started_at });
    }

    pub fn remove(&mut self, vm_name: &str) {
        self.vms.remove(vm_name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_write_then_read_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");
        let snap = NetworkSnapshot {
            driver: "linux-bridge-vlan".into(),
            host_bridge: "br0".into(),
            taps: vec![TapSnapshot {
                name: "f0-vma".into(),
                index: 0,
                vlan: Some(42),
            }],
        };
        snap.save(&path).unwrap();
        let loaded = NetworkSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn missing_file_is_not_an_error_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(NetworkSnapshot::load(&path).unwrap().is_none());
        assert_eq!(RunningSet::load(&path).unwrap(), RunningSet::default());
    }

    #[test]
    fn redaction_covers_case_insensitive_keys_and_ssh_public_key() {
        let payload = serde_json::json!({
            "vm_name": "vm-a",
            "Password": "hunter2",
            "nested": {
                "vncPassword": "abc123",
                "SSH.PublicKey": "ssh-ed25519 AAAA...",
                "keep": "visible",
            }
        });
        let redacted = redact_payload(&payload);
        assert_eq!(redacted["vm_name"], "vm-a");
        assert_eq!(redacted["Password"], REDACTED_PLACEHOLDER);
        assert_eq!(redacted["nested"]["vncPassword"], REDACTED_PLACEHOLDER);
        assert_eq!(redacted["nested"]["SSH.PublicKey"], REDACTED_PLACEHOLDER);
        assert_eq!(redacted["nested"]["keep"], "visible");
    }

    #[test]
    fn payload_round_trip_is_byte_identical_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("create-spec-vm-a.json");
        // Deliberately out-of-alphabetical-order keys and unusual spacing:
        // a reserialized `serde_json::Value` (BTreeMap-backed without
        // `preserve_order`) would not survive this unchanged.
        let original = b"{\"password\":   \"hunter2\", \"vm_name\": \"vm-a\"}".to_vec();
        CreatePayload(original.clone()).save(&path).unwrap();
        let loaded = CreatePayload::load(&path).unwrap().unwrap();
        assert_eq!(loaded.0, original);
        assert_eq!(loaded.redacted().unwrap()["password"], REDACTED_PLACEHOLDER);
    }

    #[test]
    fn running_set_insert_and_remove() {
        let mut set = RunningSet::default();
        set.insert("vm-a", 1234, Utc::now());
        assert!(set.vms.contains_key("vm-a"));
        set.remove("vm-a");
        assert!(!set.vms.contains_key("vm-a"));
    }
}
