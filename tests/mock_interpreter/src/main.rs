//! Mock interpreter for integration testing
//!
//! Behaves like the interpreter's built-in web server as far as the gateway
//! can tell: `-S host:port` and `-t dir` are honoured, every other argument is
//! ignored, and diagnostics are written to stderr as `[timestamp] text`
//! lines, with a request's access line written after its error lines.
//!
//! Scripts are plain files in the document root, one directive per line:
//! - `status <code>`: response status (default 200)
//! - `header <Name>: <value>`: add a response header
//! - `log <text>`: write a diagnostic line
//! - `sleep <ms>`: pause before responding
//! - `body <text>`: append text to the body
//! - `line <text>`: append text and a newline to the body
//! - `fill <n>`: append `n` bytes of filler to the body
//! - `echo`: append the request body
//! - `crash`: exit without responding
//! - `exit`: respond, then exit before writing the access line

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let mut host = None;
    let mut root = PathBuf::from(".");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-S" => host = args.next(),
            "-t" => {
                if let Some(dir) = args.next() {
                    root = PathBuf::from(dir);
                }
            }
            _ => {}
        }
    }

    let Some(host) = host else {
        eprintln!("Usage: mock-interpreter -S <addr>:<port> [-t docroot]");
        std::process::exit(64);
    };

    let listener = match TcpListener::bind(&host).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("{} Failed to listen on {} (reason: {})", timestamp(), host, e);
            std::process::exit(1);
        }
    };

    eprintln!("{} Mock Development Server (http://{}) started", timestamp(), host);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let root = root.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer.port(), &root).await;
                });
            }
            Err(e) => {
                eprintln!("{} Accept failed: {}", timestamp(), e);
            }
        }
    }
}

/// Bracketed timestamp; deliberately not the width the real server uses
fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("[{}.{:06}]", now.as_secs(), now.subsec_micros())
}

struct Script {
    status: u16,
    headers: Vec<String>,
    body: Vec<u8>,
    exit_after_response: bool,
}

async fn handle_connection(mut stream: TcpStream, peer_port: u16, root: &Path) {
    eprintln!("{} 127.0.0.1:{} Accepted", timestamp(), peer_port);

    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];

    // Read HTTP request headers
    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 65536 {
            return;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("GET").to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut request_body = buf[header_end..].to_vec();
    while request_body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        request_body.extend_from_slice(&temp[..n]);
    }

    let path = target.split('?').next().unwrap_or("/");
    let file = root.join(path.trim_start_matches('/'));

    let script = match tokio::fs::read_to_string(&file).await {
        Ok(source) => run_script(&source, &request_body).await,
        Err(_) => Script {
            status: 404,
            headers: Vec::new(),
            body: b"Not Found".to_vec(),
            exit_after_response: false,
        },
    };

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        script.status,
        if script.status == 200 { "OK" } else { "Status" },
        script.body.len()
    );
    for header in &script.headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(&script.body);
    let _ = stream.write_all(&bytes).await;
    let _ = stream.flush().await;

    if script.exit_after_response {
        std::process::exit(3);
    }

    eprintln!(
        "{} 127.0.0.1:{} [{}]: {} {}",
        timestamp(),
        peer_port,
        script.status,
        method,
        target
    );
    eprintln!("{} 127.0.0.1:{} Closing", timestamp(), peer_port);
}

async fn run_script(source: &str, request_body: &[u8]) -> Script {
    let mut script = Script {
        status: 200,
        headers: Vec::new(),
        body: Vec::new(),
        exit_after_response: false,
    };

    for line in source.lines() {
        let (directive, rest) = line.split_once(' ').unwrap_or((line, ""));
        match directive {
            "status" => script.status = rest.trim().parse().unwrap_or(200),
            "header" => script.headers.push(rest.to_string()),
            "log" => eprintln!("{} {}", timestamp(), rest),
            "sleep" => {
                let ms = rest.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "body" => script.body.extend_from_slice(rest.as_bytes()),
            "line" => {
                script.body.extend_from_slice(rest.as_bytes());
                script.body.push(b'\n');
            }
            "fill" => {
                let n: usize = rest.trim().parse().unwrap_or(0);
                script.body.resize(script.body.len() + n, b'x');
            }
            "echo" => script.body.extend_from_slice(request_body),
            "crash" => std::process::exit(70),
            "exit" => script.exit_after_response = true,
            _ => {}
        }
    }

    script
}
