//! A minimal, synchronous speaker of Firecracker's UNIX-socket control
//! protocol (§4.7): hand-rolled HTTP request framing over a `UnixStream`,
//! parsed with `httparse`, `fslock`-protected for the duration of one
//! request/response pair. A direct port of the teacher's
//! `agent::sync_agent::Agent`, narrowed to the three operations this agent
//! needs and replacing its non-blocking-read-plus-retry loop with a single
//! read bounded by a socket timeout.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use fslock::LockFile;
use log::debug;

const CONNECT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// `(status_code, body_bytes)`. Any transport error yields status `0`.
pub type ControlResponse = (u16, Vec<u8>);

fn lock_path_for(socket: &Path) -> std::path::PathBuf {
    socket.with_extension("lock")
}

fn call(socket: &Path, method: &str, path: &str, body: Option<&str>) -> ControlResponse {
    match call_inner(socket, method, path, body) {
        Ok(resp) => resp,
        Err(e) => {
            debug!("hypervisor control call {method} {path} failed: {e}");
            (0, Vec::new())
        }
    }
}

fn call_inner(socket: &Path, method: &str, path: &str, body: Option<&str>) -> std::io::Result<ControlResponse> {
    let mut lock = LockFile::open(&lock_path_for(socket))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    lock.lock()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(CONNECT_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECT_READ_TIMEOUT))?;

    let result = send_and_receive(stream, method, path, body);
    let _ = lock.unlock();
    result
}

fn send_and_receive(
    mut stream: UnixStream,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> std::io::Result<ControlResponse> {
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= MAX_RESPONSE_BYTES {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let parse_status = response
        .parse(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let header_end = match parse_status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete response headers",
            ))
        }
    };
    let status = response.code.unwrap_or(0);
    let body = buf[header_end..].to_vec();
    Ok((status, body))
}

/// `PUT /actions` with `{"action_type":"SendCtrlAltDel"}`.
pub fn send_ctrl_alt_del(socket: &Path) -> std::io::Result<()> {
    let (status, _) = call(
        socket,
        "PUT",
        "/actions",
        Some(r#"{"action_type":"SendCtrlAltDel"}"#),
    );
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("control socket returned status {status}"),
        ))
    }
}

/// `GET /version` — the Firecracker version string, or `0` status on failure.
pub fn get_version(socket: &Path) -> ControlResponse {
    call(socket, "GET", "/version", None)
}

/// `GET /machine-config` — the current machine configuration document.
pub fn get_machine_config(socket: &Path) -> ControlResponse {
    call(socket, "GET", "/machine-config", None)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn transport_error_yields_status_zero() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("absent.socket");
        let (status, body) = get_version(&socket);
        assert_eq!(status, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn parses_status_and_body_from_a_real_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("fc.socket");
        let listener = UnixListener::bind(&socket).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let body = r#"{"firecracker_version":"1.0.0"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        let (status, body) = get_version(&socket);
        handle.join().unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, br#"{"firecracker_version":"1.0.0"}"#);
    }
}
