//! Read-only HTTP query service.
//!
//! `GET /detections` renders a store snapshot; `GET /health` reports per-stream
//! freshness and worker counters. Requests only ever take a snapshot, so a
//! stalled camera or a slow detector cannot hold up a response. Each accepted
//! connection gets its own short-lived thread, so a slow client only delays
//! itself.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::render::{render_detections, DetectionsResponse};
use crate::store::DetectionStore;
use crate::stream::StreamId;
use crate::worker::{StatsSnapshot, WorkerStats};

const MAX_REQUEST_BYTES: usize = 8192;
/// Whole-request budget for reading the request head.
const REQUEST_READ_DEADLINE: Duration = Duration::from_secs(2);
/// Connections served at once; extra ones get a 503.
const MAX_IN_FLIGHT: usize = 64;
const ACCEPT_IDLE_PAUSE: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Body of `GET /health`.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub streams: Vec<StreamHealth>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamHealth {
    pub id: StreamId,
    pub has_data: bool,
    /// Age of the latest publication.
    pub age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

/// Side-effect-free views over the store.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<DetectionStore>,
    stats: Vec<(StreamId, Arc<WorkerStats>)>,
}

impl QueryService {
    pub fn new(store: Arc<DetectionStore>) -> Self {
        Self {
            store,
            stats: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: Vec<(StreamId, Arc<WorkerStats>)>) -> Self {
        self.stats = stats;
        self
    }

    pub fn detections(&self) -> DetectionsResponse {
        DetectionsResponse {
            detections: render_detections(&self.store.snapshot()),
        }
    }

    pub fn health(&self) -> HealthResponse {
        let snapshot = self.store.snapshot();
        let streams = snapshot
            .iter()
            .map(|entry| StreamHealth {
                id: entry.stream.clone(),
                has_data: entry.has_data(),
                age_ms: entry
                    .publication
                    .as_ref()
                    .map(|p| p.age().as_millis() as u64),
                stats: self
                    .stats
                    .iter()
                    .find(|(id, _)| *id == entry.stream)
                    .map(|(_, stats)| stats.snapshot()),
            })
            .collect();
        HealthResponse {
            status: "ok",
            streams,
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    query: QueryService,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, query: QueryService) -> Self {
        Self { cfg, query }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api to {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let query = self.query;
        let join = std::thread::Builder::new()
            .name("surround-api".to_string())
            .spawn(move || run_api(listener, query, shutdown_thread))
            .context("spawn api thread")?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, query: QueryService, shutdown: Arc<AtomicBool>) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => dispatch(stream, peer, &query, &in_flight),
            Err(err) => std::thread::sleep(accept_error_pause(&err)),
        }
    }
    log::info!("query api stopped");
}

/// Pause before the next accept. Only shutdown ends the accept loop; errors
/// such as an aborted handshake or fd exhaustion are logged and retried.
fn accept_error_pause(err: &std::io::Error) -> Duration {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return ACCEPT_IDLE_PAUSE;
    }
    log::warn!("query api accept failed: {}", err);
    ACCEPT_ERROR_PAUSE
}

/// Decrements the in-flight counter when a connection thread ends.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn dispatch(
    mut stream: TcpStream,
    peer: SocketAddr,
    query: &QueryService,
    in_flight: &Arc<AtomicUsize>,
) {
    if in_flight.fetch_add(1, Ordering::SeqCst) >= MAX_IN_FLIGHT {
        in_flight.fetch_sub(1, Ordering::SeqCst);
        log::warn!("query api busy, rejecting {}", peer);
        let _ = stream
            .set_nonblocking(false)
            .map_err(anyhow::Error::from)
            .and_then(|_| write_json_response(&mut stream, 503, r#"{"error":"busy"}"#));
        return;
    }
    let guard = InFlight(in_flight.clone());
    let query = query.clone();
    let spawned = std::thread::Builder::new()
        .name("surround-api-conn".to_string())
        .spawn(move || {
            let _guard = guard;
            if let Err(err) = handle_connection(stream, &query) {
                log::warn!("query api request from {} failed: {}", peer, err);
            }
        });
    if let Err(err) = spawned {
        // The closure, guard included, was dropped with the failed spawn.
        log::warn!("query api could not spawn a connection thread: {}", err);
    }
}

fn handle_connection(mut stream: TcpStream, query: &QueryService) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
    }
    match request.path.as_str() {
        "/detections" => {
            let payload = serde_json::to_vec(&query.detections())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/health" => {
            let payload = serde_json::to_vec(&query.health())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let deadline = Instant::now() + REQUEST_READ_DEADLINE;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("request not received within {:?}", REQUEST_READ_DEADLINE));
        }
        stream.set_read_timeout(Some(remaining))?;
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionSet;

    fn query() -> QueryService {
        let streams = ["Front", "Left", "Right"].map(|s| StreamId::new(s).unwrap());
        let store = Arc::new(DetectionStore::new(streams).unwrap());
        store
            .publish(&StreamId::new("Front").unwrap(), DetectionSet::from_labels(["car"]))
            .unwrap();
        QueryService::new(store)
    }

    #[test]
    fn detections_body_serializes_under_one_key() {
        let body = serde_json::to_value(query().detections()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"detections": "Front:{car} | Left:{} | Right:{}"})
        );
    }

    #[test]
    fn health_reports_data_per_stream() {
        let health = query().health();
        assert_eq!(health.status, "ok");
        let flags: Vec<bool> = health.streams.iter().map(|s| s.has_data).collect();
        assert_eq!(flags, vec![true, false, false]);
        assert!(health.streams[0].age_ms.is_some());
        assert!(health.streams[1].age_ms.is_none());
        assert!(health.streams[0].stats.is_none());
    }

    #[test]
    fn accept_errors_pause_instead_of_stopping() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            accept_error_pause(&Error::from(ErrorKind::WouldBlock)),
            ACCEPT_IDLE_PAUSE
        );
        for kind in [ErrorKind::ConnectionAborted, ErrorKind::ConnectionReset, ErrorKind::Other] {
            assert_eq!(accept_error_pause(&Error::from(kind)), ACCEPT_ERROR_PAUSE);
        }
    }

    #[test]
    fn slow_request_head_hits_the_overall_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = std::thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            // Each byte lands well inside a single read timeout; only the
            // overall deadline can end this.
            for byte in b"GET /detections HTTP/1.1\r\n" {
                if client.write_all(&[*byte]).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(400));
            }
        });

        let (mut stream, _) = listener.accept().unwrap();
        let started = Instant::now();
        assert!(read_request(&mut stream).is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= REQUEST_READ_DEADLINE - Duration::from_millis(100));
        assert!(elapsed < REQUEST_READ_DEADLINE + Duration::from_secs(1));
        drop(stream);
        writer.join().unwrap();
    }

    #[test]
    fn health_includes_worker_stats_when_attached() {
        let stats = Arc::new(WorkerStats::new());
        stats.record_restart();
        let query = query().with_stats(vec![(StreamId::new("Left").unwrap(), stats)]);
        let health = query.health();
        assert!(health.streams[0].stats.is_none());
        assert_eq!(health.streams[1].stats.as_ref().unwrap().restarts, 1);
    }
}
