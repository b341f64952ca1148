use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use surround_detect::api::{ApiConfig, ApiHandle, ApiServer, QueryService};
use surround_detect::{DetectionSet, DetectionStore, StreamId, WorkerStats};

struct TestApi {
    handle: Option<ApiHandle>,
    store: Arc<DetectionStore>,
}

impl TestApi {
    fn start() -> Self {
        let ids = ["Front", "Left", "Right"].map(|id| StreamId::new(id).unwrap());
        let store = Arc::new(DetectionStore::new(ids).expect("store"));
        let stats = vec![(StreamId::new("Front").unwrap(), Arc::new(WorkerStats::new()))];
        let query = QueryService::new(store.clone()).with_stats(stats);
        let handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            query,
        )
        .spawn()
        .expect("spawn api");
        Self {
            handle: Some(handle),
            store,
        }
    }

    fn publish(&self, stream: &str, labels: &[&str]) {
        self.store
            .publish(
                &StreamId::new(stream).unwrap(),
                DetectionSet::from_labels(labels.iter().copied()),
            )
            .expect("publish");
    }

    fn request(&self, method: &str, path: &str) -> (u16, String) {
        let addr = self.handle.as_ref().expect("api running").addr;
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        write!(
            stream,
            "{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n",
            method, path
        )
        .expect("write request");

        let mut raw = String::new();
        stream.read_to_string(&mut raw).expect("read response");
        let (head, body) = raw.split_once("\r\n\r\n").expect("http response");
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");
        (status, body.to_string())
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop();
        }
    }
}

fn detections_field(body: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(body).expect("json body");
    json["detections"].as_str().expect("detections string").to_string()
}

#[test]
fn detections_render_every_stream_in_order() {
    let api = TestApi::start();
    api.publish("Front", &["car"]);
    api.publish("Left", &[]);
    api.publish("Right", &["person", "bike"]);

    let (status, body) = api.request("GET", "/detections");
    assert_eq!(status, 200);
    assert_eq!(
        detections_field(&body),
        "Front:{car} | Left:{} | Right:{person,bike}"
    );
}

#[test]
fn streams_without_data_render_empty() {
    let api = TestApi::start();
    let (status, body) = api.request("GET", "/detections");
    assert_eq!(status, 200);
    assert_eq!(detections_field(&body), "Front:{} | Left:{} | Right:{}");
}

#[test]
fn latest_publish_wins_and_query_strings_are_ignored() {
    let api = TestApi::start();
    api.publish("Front", &["dog"]);
    api.publish("Front", &["dog", "cat"]);

    let (status, body) = api.request("GET", "/detections?stream=Left");
    assert_eq!(status, 200);
    assert_eq!(
        detections_field(&body),
        "Front:{dog,cat} | Left:{} | Right:{}"
    );
}

#[test]
fn health_reports_streams_and_counters() {
    let api = TestApi::start();
    api.publish("Left", &["truck"]);

    let (status, body) = api.request("GET", "/health");
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(json["status"], "ok");
    let streams = json["streams"].as_array().expect("streams array");
    assert_eq!(streams.len(), 3);
    assert_eq!(streams[0]["id"], "Front");
    assert_eq!(streams[0]["has_data"], false);
    assert_eq!(streams[0]["stats"]["publishes"], 0);
    assert_eq!(streams[1]["has_data"], true);
    assert!(streams[1]["age_ms"].is_u64());
    assert!(streams[1].get("stats").is_none());
}

#[test]
fn unknown_paths_and_methods_are_rejected() {
    let api = TestApi::start();
    let (status, _) = api.request("GET", "/events");
    assert_eq!(status, 404);
    let (status, _) = api.request("POST", "/detections");
    assert_eq!(status, 405);
}

#[test]
fn idle_client_does_not_delay_other_requests() {
    let api = TestApi::start();
    api.publish("Front", &["car"]);
    let addr = api.handle.as_ref().expect("api running").addr;

    // Connected but never sends a request.
    let idle = TcpStream::connect(addr).expect("connect idle client");
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let (status, body) = api.request("GET", "/detections");
    let elapsed = started.elapsed();
    assert_eq!(status, 200);
    assert_eq!(detections_field(&body), "Front:{car} | Left:{} | Right:{}");
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    drop(idle);
}

#[test]
fn aborted_connections_do_not_stop_the_server() {
    let api = TestApi::start();
    let addr = api.handle.as_ref().expect("api running").addr;

    for _ in 0..5 {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.shutdown(Shutdown::Both).expect("shutdown");
    }
    let mut partial = TcpStream::connect(addr).expect("connect");
    partial.write_all(b"GET /detec").expect("write partial request");
    drop(partial);

    let (status, body) = api.request("GET", "/detections");
    assert_eq!(status, 200);
    assert_eq!(detections_field(&body), "Front:{} | Left:{} | Right:{}");
}
