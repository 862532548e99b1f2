//! Test-only helpers: temp directories and a minimal loopback HTTP tool stub.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub fn temp_dir(label: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("tool-orch-{label}-{stamp}"));
    std::fs::create_dir_all(&path).expect("create temp dir");
    path
}

/// Behaviour knobs shared between a stub and the test driving it.
#[derive(Debug, Default)]
pub struct StubState {
    pub unhealthy: AtomicBool,
    pub health_hits: AtomicUsize,
}

/// Serves the routes a tool binary would:
/// `/health`, `/echo` (echoes the body, or `GET`), `/fail` (500), `/page` (html).
pub fn serve_tool_stub(listener: TcpListener, state: Arc<StubState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, &state).await;
            });
        }
    })
}

pub async fn bind_stub(state: Arc<StubState>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let port = listener.local_addr().expect("addr").port();
    (port, serve_tool_stub(listener, state))
}

async fn handle_connection(mut stream: TcpStream, state: &StubState) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    let path = target.split('?').next().unwrap_or_default();
    let (status, content_type, payload): (&str, &str, Vec<u8>) = match path {
        "/health" => {
            state.health_hits.fetch_add(1, Ordering::SeqCst);
            if state.unhealthy.load(Ordering::SeqCst) {
                ("503 Service Unavailable", "text/plain", b"warming up".to_vec())
            } else {
                ("200 OK", "text/plain", b"ok".to_vec())
            }
        }
        "/echo" if method == "GET" => ("200 OK", "application/json", b"GET".to_vec()),
        "/echo" => ("200 OK", "application/json", body),
        "/fail" => ("500 Internal Server Error", "text/plain", b"tool exploded".to_vec()),
        "/page" => ("200 OK", "text/html", b"<p>widget</p>".to_vec()),
        _ => ("404 Not Found", "text/plain", b"not found".to_vec()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.shutdown().await
}
