//! Surround detection relay
//!
//! This crate watches several camera streams at once and serves the latest
//! object-detection result of each over HTTP.
//!
//! # Architecture
//!
//! 1. **Stream workers** pull a frame from their source, run the detector and
//!    publish the resulting label set. One OS thread per stream.
//! 2. **Detection store** keeps exactly one latest `DetectionSet` per stream.
//!    Publishing replaces; reads take a copy.
//! 3. **Supervisor** starts one worker per stream, restarts crashed workers
//!    and stops them all cooperatively.
//! 4. **Query service** renders a store snapshot as
//!    `Front:{car} | Left:{} | Right:{person,bike}`.
//!
//! # Module Structure
//!
//! - `frame`, `stream`: core data types
//! - `ingest`: frame sources (stub, RTSP, HTTP)
//! - `detect`: detector backends, shared handle, registry
//! - `store`, `render`: shared state and its wire rendering
//! - `worker`, `supervisor`, `backoff`, `shutdown`: stream lifecycle
//! - `api`, `config`: daemon surfaces

pub mod api;
pub mod backoff;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod render;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use api::{ApiConfig, ApiHandle, ApiServer, QueryService};
pub use backoff::Backoff;
pub use config::SurroundConfig;
pub use detect::{BackendRegistry, DetectionSet, DetectorBackend, DetectorHandle, StubBackend};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, RtspConfig, RtspSource, SourceError, SourceSettings};
pub use render::{render_detections, DetectionsResponse};
pub use shutdown::ShutdownSignal;
pub use store::{DetectionStore, Publication, PublishError, SnapshotEntry, StoreSnapshot};
pub use stream::StreamId;
pub use supervisor::{SourceFactory, StreamSpec, Supervisor, SupervisorHandle, SupervisorSettings};
pub use worker::{CycleOutcome, Pacing, StatsSnapshot, StreamWorker, WorkerSettings, WorkerStats};
