//! Thread-per-connection HTTP/1.1 listener.
//!
//! Grounded on the reference implementation's `ThreadedHTTPServer`
//! (`SO_REUSEADDR`, one worker thread per accepted connection, a
//! non-blocking `start` that spawns an acceptor, and a `stop` that closes
//! the listener and joins in-flight workers) translated to
//! `std::net::TcpListener` + `std::thread::spawn` per §5's synchronous,
//! non-async concurrency model.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use api_buddy_core::headers::HeaderMap;
use tracing::{debug, error, info, warn};

use crate::pipeline::{Pipeline, Request, Response};

pub struct Server {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn bind(addr: &str, pipeline: Arc<Pipeline>) -> std::io::Result<Self> {
        let sock_addr: std::net::SocketAddr = addr.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind address {addr}: {e}"))
        })?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&sock_addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        Ok(Self { listener, pipeline, shutdown: Arc::new(AtomicBool::new(false)), workers: Mutex::new(Vec::new()) })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until [`Server::stop`] is called, spawning one
    /// worker thread per connection. Blocks the calling thread.
    pub fn serve_forever(&self) {
        info!("accepting connections");
        for incoming in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match incoming {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let pipeline = self.pipeline.clone();
            let handle = std::thread::spawn(move || {
                if let Err(e) = handle_connection(stream, &pipeline) {
                    debug!(error = %e, "connection handler exited with an error");
                }
            });
            self.workers.lock().expect("server workers mutex poisoned").push(handle);
        }
        info!("stopped accepting connections");
    }

    /// Unblocks `serve_forever` by connecting to the listener once (to
    /// break out of the blocking `accept` call) and waits for in-flight
    /// workers to complete.
    pub fn stop(&self) {
        info!("stopping server");
        self.shutdown.store(true, Ordering::SeqCst);
        if let Ok(addr) = self.listener.local_addr() {
            let _ = TcpStream::connect(addr);
        }
        let mut workers = self.workers.lock().expect("server workers mutex poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("server stopped");
    }
}

fn handle_connection(mut stream: TcpStream, pipeline: &Pipeline) -> std::io::Result<()> {
    let request = match read_request(&mut stream)? {
        Some(r) => r,
        None => return Ok(()),
    };
    let response = pipeline.handle(request);
    write_response(&mut stream, &response)
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 1024 * 1024 {
            return Ok(None);
        }
    };

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    let status = parsed.parse(&buf[..header_end]).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("malformed request: {e}"))
    })?;
    if status.is_partial() {
        return Ok(None);
    }

    let method = parsed.method.unwrap_or("GET").to_string();
    let path = parsed.path.unwrap_or("/").to_string();
    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        headers.append(h.name, String::from_utf8_lossy(h.value).into_owned());
    }

    let content_length: usize =
        headers.get("Content-Length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request { method, path, headers, body }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn write_response(stream: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let reason = reason_phrase(response.status);
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, reason).into_bytes();
    let mut headers = response.headers.clone();
    if headers.get("Content-Length").is_none() {
        headers.insert("Content-Length", response.body.len().to_string());
    }
    for (name, value) in headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    stream.write_all(&out)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}
