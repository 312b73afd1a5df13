use std::time::Duration;

use serde_json::Value;
use tiny_http::Method;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::{lifecycle, state};

/// Manual method+path router over the table in §4.9. The route table is
/// small and stable, so this is a straight match rather than a crate.
pub fn route(config: &Config, method: &Method, url: &str, body: &str) -> Result<Value> {
    let segments: Vec<&str> = url.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (Method::Get, ["healthz"]) => Ok(serde_json::json!({ "status": "success" })),

        (Method::Post, ["v1", "vms"]) => create(config, body),
        (Method::Get, ["v1", "vms"]) => list(config),

        (Method::Get, ["v1", "vms", name, "status"]) => Ok(status(config, name)),
        (Method::Get, ["v1", "vms", name, "details"]) => lifecycle::inspect(config, name),
        (Method::Post, ["v1", "vms", name, "start"]) => start(config, name, body),
        (Method::Post, ["v1", "vms", name, "stop"]) => stop(config, name, body),
        (Method::Post, ["v1", "vms", name, "reboot"]) => reboot(config, name, body),
        (Method::Delete, ["v1", "vms", name]) => delete(config, name),
        (Method::Post, ["v1", "vms", name, "recover"]) => recover(config, name, body),
        (Method::Post, ["v1", "vms", name, "console"]) => console(config, name),

        (Method::Get, ["v1", "network-config", name]) => network_config_get(config, name),
        (Method::Post, ["v1", "network-config", name, "apply"]) => recover(config, name, body),
        (Method::Delete, ["v1", "network-config", name]) => network_config_delete(config, name),

        (Method::Post, ["v1", "graceful-shutdown"]) => graceful_shutdown(config),
        (Method::Post, ["v1", "save-states"]) => save_states(config),
        (Method::Post, ["v1", "recover-all"]) => recover_all(config),

        _ => Err(AgentError::NotFound(format!("no such route: {method} {url}"))),
    }
}

fn parse_body(body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(Into::into)
}

fn timeout_from(body: &Value) -> Option<Duration> {
    body.get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
}

fn create(config: &Config, body: &str) -> Result<Value> {
    let spec = lifecycle::create(config, body.as_bytes())?;
    Ok(serde_json::json!({ "status": "success", "vm_name": spec.name }))
}

fn list(config: &Config) -> Result<Value> {
    let names = lifecycle::list_vms(config)?;
    Ok(serde_json::json!({ "status": "success", "vms": names }))
}

fn status(config: &Config, name: &str) -> Value {
    let status = lifecycle::status(config, name);
    let power_state = match status {
        crate::process::supervisor::VmStatus::PowerOn => "poweron",
        crate::process::supervisor::VmStatus::PowerOff => "poweroff",
    };
    serde_json::json!({ "status": "success", "vm_name": name, "power_state": power_state })
}

fn start(config: &Config, name: &str, body: &str) -> Result<Value> {
    let body = parse_body(body)?;
    let spec = resolve_spec(config, name, &body)?;
    lifecycle::start(config, &spec)?;
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

fn stop(config: &Config, name: &str, body: &str) -> Result<Value> {
    let body = parse_body(body)?;
    lifecycle::stop(config, name, timeout_from(&body))?;
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

fn reboot(config: &Config, name: &str, body: &str) -> Result<Value> {
    let body = parse_body(body)?;
    let spec = lifecycle::load_spec(config, name)?;
    lifecycle::reboot(config, &spec, timeout_from(&body))?;
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

fn delete(config: &Config, name: &str) -> Result<Value> {
    let spec = lifecycle::load_spec(config, name)?;
    lifecycle::delete(config, &spec)?;
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

fn recover(config: &Config, name: &str, body: &str) -> Result<Value> {
    let body = parse_body(body)?;
    let spec = resolve_spec(config, name, &body)?;
    lifecycle::recover(config, &spec)?;
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

/// Starts (or reuses) the console bridge for a running VM and returns its
/// connection details. 404s when the VM isn't up; 500s when no console
/// defaults are configured for this host.
fn console(config: &Config, name: &str) -> Result<Value> {
    let status = lifecycle::status(config, name);
    if status != crate::process::supervisor::VmStatus::PowerOn {
        return Err(AgentError::NotFound(format!("'{name}' is not running")));
    }
    let console_defaults = config.defaults.console.as_ref().ok_or_else(|| {
        AgentError::Internal("console bridge is not configured for this host".to_string())
    })?;
    let session = crate::process::supervisor::ProcessSupervisor::session_name(name);
    let bridge = crate::console::start_or_reuse(console_defaults, &config.defaults.host.run_dir, name, &session)?;
    Ok(serde_json::json!({
        "status": "success",
        "vm_name": name,
        "host": bridge.bind_host,
        "port": bridge.port,
        "password": bridge.password,
    }))
}

fn network_config_get(config: &Config, name: &str) -> Result<Value> {
    let paths = crate::paths::VmPaths::derive(name, &config.defaults.host, &config.defaults.storage);
    let snapshot: Option<Value> = state::store::read_json(&paths.network_snapshot_file)?;
    match snapshot {
        Some(snapshot) => Ok(serde_json::json!({ "status": "success", "vm_name": name, "network": snapshot })),
        None => Err(AgentError::NotFound(format!("no network snapshot for '{name}'"))),
    }
}

fn network_config_delete(config: &Config, name: &str) -> Result<Value> {
    let paths = crate::paths::VmPaths::derive(name, &config.defaults.host, &config.defaults.storage);
    if paths.network_snapshot_file.exists() {
        std::fs::remove_file(&paths.network_snapshot_file)?;
    }
    Ok(serde_json::json!({ "status": "success", "vm_name": name }))
}

fn graceful_shutdown(config: &Config) -> Result<Value> {
    let names = lifecycle::list_vms(config)?;
    for name in &names {
        if let Err(e) = lifecycle::stop(config, name, None) {
            log::warn!("graceful-shutdown: stop '{name}' failed, continuing: {e}");
        }
    }
    Ok(serde_json::json!({ "status": "success" }))
}

fn save_states(config: &Config) -> Result<Value> {
    let names = lifecycle::list_vms(config)?;
    lifecycle::save_states(config, &names)?;
    Ok(serde_json::json!({ "status": "success" }))
}

fn recover_all(config: &Config) -> Result<Value> {
    let names = lifecycle::list_vms(config)?;
    for name in &names {
        match lifecycle::load_spec(config, name) {
            Ok(spec) => {
                if let Err(e) = lifecycle::recover(config, &spec) {
                    log::warn!("recover-all: recover '{name}' failed, continuing: {e}");
                }
            }
            Err(e) => log::warn!("recover-all: loading spec for '{name}' failed, continuing: {e}"),
        }
    }
    Ok(serde_json::json!({ "status": "success" }))
}

/// A non-empty object body re-resolves the `Spec`; otherwise the
/// persisted create payload is loaded and re-parsed.
fn resolve_spec(config: &Config, name: &str, body: &Value) -> Result<crate::spec::Spec> {
    match body {
        Value::Object(map) if !map.is_empty() => crate::spec::Spec::from_payload(body, config),
        _ => lifecycle::load_spec(config, name),
    }
}
