use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use surround_detect::config::SurroundConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SURROUND_CONFIG",
        "SURROUND_STREAMS",
        "SURROUND_SAMPLE_INTERVAL_MS",
        "SURROUND_API_ADDR",
        "SURROUND_DETECTOR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = SurroundConfig::load().expect("load defaults");
    let ids: Vec<&str> = cfg.streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["Front", "Left", "Right"]);
    assert!(cfg.streams.iter().all(|s| s.url.starts_with("stub://")));
    assert_eq!(cfg.api_addr, "0.0.0.0:5000");
    assert_eq!(cfg.sampling.interval, Duration::from_secs(1));
    assert_eq!(cfg.sampling.max_read_failures, 5);
    assert_eq!(cfg.backoff.initial, Duration::from_secs(1));
    assert_eq!(cfg.backoff.max, Duration::from_secs(30));
    assert_eq!(cfg.restart_delay, Duration::from_secs(2));
    assert_eq!(cfg.detector.backend, "stub");
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "streams": [
            {"id": "Rear", "url": "stub://rear_camera"},
            {"id": "Front", "url": "stub://front_camera"}
        ],
        "sampling": {"interval_ms": 250, "read_retry_ms": 100, "max_read_failures": 3},
        "backoff": {"initial_ms": 500, "max_ms": 8000},
        "supervisor": {"restart_delay_ms": 750, "health_log_secs": 0},
        "api": {"addr": "127.0.0.1:9000"},
        "detector": {"backend": "stub", "stub_labels": ["car"]},
        "source": {"width": 320, "height": 240}
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SURROUND_CONFIG", file.path());
    std::env::set_var("SURROUND_SAMPLE_INTERVAL_MS", "400");
    std::env::set_var("SURROUND_API_ADDR", "127.0.0.1:9100");

    let cfg = SurroundConfig::load().expect("load config");
    let ids: Vec<&str> = cfg.streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["Rear", "Front"]);
    assert_eq!(cfg.sampling.interval, Duration::from_millis(400));
    assert_eq!(cfg.sampling.read_retry, Duration::from_millis(100));
    assert_eq!(cfg.sampling.max_read_failures, 3);
    assert_eq!(cfg.backoff.max, Duration::from_secs(8));
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.detector.stub_labels, vec!["car"]);
    assert_eq!(cfg.source.width, 320);

    let worker = cfg.worker_settings();
    assert_eq!(worker.backoff_initial, Duration::from_millis(500));
    let supervisor = cfg.supervisor_settings();
    assert_eq!(supervisor.restart_delay, Duration::from_millis(750));
    assert!(supervisor.health_log_interval.is_none());
    assert_eq!(cfg.stream_specs().len(), 2);

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[[streams]]
id = "Front"
url = "stub://front_camera"

[sampling]
interval_ms = 2000

[api]
addr = "127.0.0.1:5050"
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = SurroundConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.streams.len(), 1);
    assert_eq!(cfg.sampling.interval, Duration::from_secs(2));
    assert_eq!(cfg.api_addr, "127.0.0.1:5050");
}

#[test]
fn streams_env_replaces_configured_list() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("SURROUND_STREAMS", "Left=stub://l, Right=stub://r");
    let cfg = SurroundConfig::load().expect("load config");
    let ids: Vec<&str> = cfg.streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["Left", "Right"]);
    assert_eq!(cfg.streams[1].url, "stub://r");

    std::env::set_var("SURROUND_STREAMS", "Left=stub://l,Left=stub://again");
    assert!(SurroundConfig::load().is_err());

    std::env::set_var("SURROUND_STREAMS", "Left");
    assert!(SurroundConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("SURROUND_SAMPLE_INTERVAL_MS", "soon");
    assert!(SurroundConfig::load().is_err());
    std::env::set_var("SURROUND_SAMPLE_INTERVAL_MS", "0");
    assert!(SurroundConfig::load().is_err());
    clear_env();

    std::env::set_var("SURROUND_DETECTOR", "yolo-9000");
    let cfg = SurroundConfig::load().expect("unknown backend is resolved by the registry");
    assert!(surround_detect::BackendRegistry::from_settings(&cfg.detector).is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"backoff": {"initial_ms": 5000, "max_ms": 1000}}"#)
        .expect("write config");
    assert!(SurroundConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"detector": {"confidence_threshold": 1.5}}"#)
        .expect("write config");
    assert!(SurroundConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"streams": [{"id": "Front", "url": "ftp://camera"}]}"#)
        .expect("write config");
    assert!(SurroundConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"cameras": []}"#).expect("write config");
    assert!(SurroundConfig::load_from(Some(file.path())).is_err());
}
