use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{check_source_url, SourceSettings};
use crate::stream::StreamId;
use crate::supervisor::{StreamSpec, SupervisorSettings};
use crate::worker::WorkerSettings;

const DEFAULT_STREAMS: [(&str, &str); 3] = [
    ("Front", "stub://front_camera"),
    ("Left", "stub://left_camera"),
    ("Right", "stub://right_camera"),
];
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_INTERVAL_MS: u64 = 1000;
const DEFAULT_READ_RETRY_MS: u64 = 1000;
const DEFAULT_MAX_READ_FAILURES: u32 = 5;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_RESTART_DELAY_MS: u64 = 2000;
const DEFAULT_HEALTH_LOG_SECS: u64 = 30;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SurroundConfigFile {
    streams: Option<Vec<StreamConfigFile>>,
    sampling: Option<SamplingConfigFile>,
    backoff: Option<BackoffConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval_ms: Option<u64>,
    read_retry_ms: Option<u64>,
    max_read_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    restart_delay_ms: Option<u64>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    class_names: Option<Vec<String>>,
    stub_labels: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

/// Daemon configuration: defaults, then the optional file named by
/// `SURROUND_CONFIG`, then `SURROUND_*` environment overrides.
#[derive(Debug, Clone)]
pub struct SurroundConfig {
    /// Streams in rendering and start-up order.
    pub streams: Vec<StreamSettings>,
    pub sampling: SamplingSettings,
    pub backoff: BackoffSettings,
    pub restart_delay: Duration,
    /// Zero disables the periodic health log.
    pub health_log_interval: Duration,
    pub api_addr: String,
    pub detector: DetectorSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub id: StreamId,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub interval: Duration,
    pub read_retry: Duration,
    pub max_read_failures: u32,
}

#[derive(Debug, Clone)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Registry name of the backend to run (`stub`, `tract`).
    pub backend: String,
    pub model_path: Option<PathBuf>,
    /// Class table for the model; COCO names when unset.
    pub class_names: Option<Vec<String>>,
    /// Labels the stub backend reports on every frame.
    pub stub_labels: Vec<String>,
    pub confidence_threshold: f32,
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            class_names: None,
            stub_labels: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl SurroundConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SURROUND_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the file path supplied by the caller.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SurroundConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SurroundConfigFile) -> Result<Self> {
        let streams = match file.streams {
            Some(streams) => streams
                .into_iter()
                .map(|s| StreamSettings::new(&s.id, &s.url))
                .collect::<Result<Vec<_>>>()?,
            None => DEFAULT_STREAMS
                .iter()
                .map(|(id, url)| StreamSettings::new(id, url))
                .collect::<Result<Vec<_>>>()?,
        };

        let sampling = file.sampling.unwrap_or_default();
        let backoff = file.backoff.unwrap_or_default();
        let supervisor = file.supervisor.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let source_defaults = SourceSettings::default();

        Ok(Self {
            streams,
            sampling: SamplingSettings {
                interval: Duration::from_millis(
                    sampling.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS),
                ),
                read_retry: Duration::from_millis(
                    sampling.read_retry_ms.unwrap_or(DEFAULT_READ_RETRY_MS),
                ),
                max_read_failures: sampling
                    .max_read_failures
                    .unwrap_or(DEFAULT_MAX_READ_FAILURES),
            },
            backoff: BackoffSettings {
                initial: Duration::from_millis(
                    backoff.initial_ms.unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
                ),
                max: Duration::from_millis(backoff.max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
            },
            restart_delay: Duration::from_millis(
                supervisor
                    .restart_delay_ms
                    .unwrap_or(DEFAULT_RESTART_DELAY_MS),
            ),
            health_log_interval: Duration::from_secs(
                supervisor.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                class_names: detector.class_names,
                stub_labels: detector.stub_labels.unwrap_or_default(),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
            source: SourceSettings {
                width: source.width.unwrap_or(source_defaults.width),
                height: source.height.unwrap_or(source_defaults.height),
                target_fps: source.target_fps.unwrap_or(source_defaults.target_fps),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(streams) = std::env::var("SURROUND_STREAMS") {
            let parsed = parse_streams(&streams)?;
            if !parsed.is_empty() {
                self.streams = parsed;
            }
        }
        if let Ok(interval) = std::env::var("SURROUND_SAMPLE_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("SURROUND_SAMPLE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.sampling.interval = Duration::from_millis(ms);
        }
        if let Ok(addr) = std::env::var("SURROUND_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr.trim().to_string();
            }
        }
        if let Ok(backend) = std::env::var("SURROUND_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(anyhow!("at least one stream must be configured"));
        }
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.id.as_str()) {
                return Err(anyhow!("stream id '{}' is configured twice", stream.id));
            }
            check_source_url(&stream.url)
                .with_context(|| format!("stream '{}'", stream.id))?;
        }
        if self.sampling.interval.is_zero() {
            return Err(anyhow!("sampling interval must be greater than zero"));
        }
        if self.sampling.max_read_failures == 0 {
            return Err(anyhow!("max_read_failures must be at least 1"));
        }
        if self.backoff.initial.is_zero() {
            return Err(anyhow!("initial backoff must be greater than zero"));
        }
        if self.backoff.max < self.backoff.initial {
            return Err(anyhow!(
                "backoff max ({} ms) is below the initial backoff ({} ms)",
                self.backoff.max.as_millis(),
                self.backoff.initial.as_millis()
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("detector confidence_threshold must be within 0..=1"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        self.detector.backend = self.detector.backend.to_lowercase();
        Ok(())
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id.clone()).collect()
    }

    /// Supervisor specs opening each stream's URL by scheme.
    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        self.streams
            .iter()
            .map(|s| StreamSpec::from_url(s.id.clone(), s.url.clone(), self.source.clone()))
            .collect()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            interval: self.sampling.interval,
            read_retry: self.sampling.read_retry,
            max_read_failures: self.sampling.max_read_failures,
            backoff_initial: self.backoff.initial,
            backoff_max: self.backoff.max,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            worker: self.worker_settings(),
            restart_delay: self.restart_delay,
            health_log_interval: (!self.health_log_interval.is_zero())
                .then_some(self.health_log_interval),
            ..SupervisorSettings::default()
        }
    }
}

impl StreamSettings {
    pub fn new(id: &str, url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(anyhow!("stream '{}' has an empty url", id));
        }
        Ok(Self {
            id: StreamId::new(id.trim())?,
            url: url.to_string(),
        })
    }
}

/// Parse `Front=rtsp://a,Left=rtsp://b`.
fn parse_streams(value: &str) -> Result<Vec<StreamSettings>> {
    split_csv(value)
        .iter()
        .map(|entry| {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("SURROUND_STREAMS entry '{}' must be NAME=URL", entry))?;
            StreamSettings::new(id, url)
        })
        .collect()
}

fn read_config_file(path: &Path) -> Result<SurroundConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
