//! The agent's HTTP surface (§4.9): a `tiny_http::Server` with a manual
//! method+path router, one thread per accepted request, logging every
//! request at `info!` on receipt.

mod handlers;

use std::sync::Arc;

use log::{error, info};
use tiny_http::{Method, Response, Server};

use crate::config::Config;

/// Verifies a caller is allowed to reach the agent. The pluggable
/// credential verifier named in the overview is out of scope here; this
/// is the trait boundary it would plug into.
pub trait CallerAuthenticator: Send + Sync {
    fn authenticate(&self, request: &tiny_http::Request) -> bool;
}

pub struct AllowAll;

impl CallerAuthenticator for AllowAll {
    fn authenticate(&self, _request: &tiny_http::Request) -> bool {
        true
    }
}

pub fn serve(config: Config, auth: Arc<dyn CallerAuthenticator>) -> std::io::Result<()> {
    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);
    let server = Server::http(&bind_addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    info!("fc-hostd listening on {bind_addr}");

    let config = Arc::new(config);
    let server = Arc::new(server);
    loop {
        let request = match server.recv() {
            Ok(r) => r,
            Err(e) => {
                error!("error receiving request: {e}");
                continue;
            }
        };

        let config = Arc::clone(&config);
        let auth = Arc::clone(&auth);
        std::thread::spawn(move || handle_request(request, &config, auth.as_ref()));
    }
}

fn handle_request(mut request: tiny_http::Request, config: &Config, auth: &dyn CallerAuthenticator) {
    info!("{} {}", request.method(), request.url());

    if !auth.authenticate(&request) {
        let _ = request.respond(error_response(401, "unauthorized"));
        return;
    }

    let method = request.method().clone();
    let url = request.url().to_string();
    let mut body = String::new();
    if matches!(method, Method::Post | Method::Put) {
        if let Err(e) = std::io::Read::read_to_string(request.as_reader(), &mut body) {
            let _ = request.respond(error_response(400, &format!("bad request body: {e}")));
            return;
        }
    }

    let success_status = success_status_for(&method, &url);
    let response = handlers::route(config, &method, &url, &body);
    match response {
        Ok(value) => {
            let _ = request.respond(json_response(success_status, &value));
        }
        Err(e) => {
            let status = e.status_code();
            let body = serde_json::json!({ "error": e.to_string() });
            let _ = request.respond(json_response(status, &body));
        }
    }
}

/// `POST /v1/vms` creates a resource and reports 201; every other route
/// reports 200 on success (Testable Scenario 1).
fn success_status_for(method: &Method, url: &str) -> u16 {
    let segments: Vec<&str> = url.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        (Method::Post, ["v1", "vms"]) => 201,
        _ => 200,
    }
}

fn json_response(status: u16, value: &serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::from_data(body)
        .with_status_code(status)
        .with_header(
            tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
        )
}

fn error_response(status: u16, message: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    json_response(status, &serde_json::json!({ "error": message }))
}
