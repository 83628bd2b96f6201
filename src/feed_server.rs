use std::fs;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};

use crate::error::InstallerError;

/// Minimal static file server for a synthetic release feed.
///
/// Serves one request at a time on loopback until the process is killed.
pub fn serve(root: &Path, port: u16) -> Result<(), InstallerError> {
    let root = fs::canonicalize(root)
        .map_err(|err| InstallerError::from_fs(err, "failed to open feed root", root))?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    tracing::info!(root = %root.display(), port, "serving release feed");
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept feed connection");
                continue;
            }
        };
        if let Err(err) = handle_connection(&root, &mut stream) {
            tracing::warn!(error = %err, "feed request failed");
        }
    }
    Ok(())
}

#[derive(Debug)]
struct FeedRequest {
    method: String,
    path: String,
}

fn handle_connection(root: &Path, stream: &mut TcpStream) -> Result<(), InstallerError> {
    let Some(request) = read_request(stream)? else {
        return Ok(());
    };
    tracing::debug!(method = %request.method, path = %request.path, "feed request");
    if request.method != "GET" {
        return write_response(stream, 405, "text/plain", b"method not allowed\n");
    }
    let Some(file) = resolve_under_root(root, &request.path) else {
        return write_response(stream, 404, "text/plain", b"not found\n");
    };
    match fs::read(&file) {
        Ok(body) => {
            let content_type = if file.extension().is_some() {
                "application/octet-stream"
            } else {
                "application/json"
            };
            write_response(stream, 200, content_type, &body)
        }
        Err(_) => write_response(stream, 404, "text/plain", b"not found\n"),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<Option<FeedRequest>, InstallerError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        if buf.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(InstallerError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "feed request headers too large",
            )));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut parts = text.lines().next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    Ok(Some(FeedRequest {
        method: method.to_string(),
        path: path.to_string(),
    }))
}

/// Maps a request path onto a regular file below `root`. Anything that would
/// climb out of the root resolves to nothing.
fn resolve_under_root(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    let canonical = fs::canonicalize(&resolved).ok()?;
    if canonical.starts_with(root) && canonical.is_file() {
        Some(canonical)
    } else {
        None
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), InstallerError> {
    let status_text = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let header = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
