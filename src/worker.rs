//! Stream worker: the pull → detect → publish loop for one stream.
//!
//! A worker owns its stream's frame source and never shares frames. Each
//! cycle either publishes a fresh `DetectionSet` or leaves the store alone;
//! a failed cycle never wipes the last good value. Waits between cycles go
//! through the `ShutdownSignal` so a stop request interrupts them at once.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::detect::DetectorHandle;
use crate::ingest::{FrameSource, SourceError};
use crate::shutdown::ShutdownSignal;
use crate::store::DetectionStore;
use crate::stream::StreamId;

/// Timing for one worker.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Wait after a completed cycle (published or detector error).
    pub interval: Duration,
    /// Wait after a transient read failure on an open source.
    pub read_retry: Duration,
    /// Consecutive read failures before the source is treated as unavailable.
    pub max_read_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            read_retry: Duration::from_secs(1),
            max_read_failures: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// What one call to `StreamWorker::run_cycle` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new detection set replaced the stream's entry.
    Published,
    /// The source could not be reached or opened.
    SourceUnavailable,
    /// The source is open but did not yield a frame.
    ReadFailure,
    /// The detector failed on this frame; nothing was published.
    DetectionFailure,
    /// The stop signal was observed.
    Cancelled,
}

/// Maps cycle outcomes to the wait before the next cycle.
#[derive(Clone, Debug)]
pub struct Pacing {
    interval: Duration,
    read_retry: Duration,
    backoff: Backoff,
}

impl Pacing {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            interval: settings.interval,
            read_retry: settings.read_retry,
            backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
        }
    }

    pub fn next_delay(&mut self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Published | CycleOutcome::DetectionFailure => {
                self.backoff.reset();
                self.interval
            }
            // Read retries leave the backoff alone so an escalation after a
            // run of read failures continues where reconnects left off.
            CycleOutcome::ReadFailure => self.read_retry,
            CycleOutcome::SourceUnavailable => self.backoff.next_delay(),
            CycleOutcome::Cancelled => Duration::ZERO,
        }
    }

    /// Last backoff handed out, if the source is currently backing off.
    pub fn current_backoff(&self) -> Option<Duration> {
        self.backoff.current()
    }
}

/// Per-stream counters, shared between a worker, its restarts and the API.
#[derive(Debug, Default)]
pub struct WorkerStats {
    cycles: AtomicU64,
    publishes: AtomicU64,
    source_failures: AtomicU64,
    read_failures: AtomicU64,
    detection_failures: AtomicU64,
    restarts: AtomicU64,
    backoff_ms: AtomicU64,
    source_healthy: AtomicBool,
    last_publish: Mutex<Option<Instant>>,
}

/// Serializable copy of `WorkerStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub publishes: u64,
    pub source_failures: u64,
    pub read_failures: u64,
    pub detection_failures: u64,
    pub restarts: u64,
    pub backoff_ms: u64,
    /// The source's own health report after the latest cycle.
    pub source_healthy: bool,
    pub last_publish_age_ms: Option<u64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, outcome: CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            CycleOutcome::Published => {
                *self
                    .last_publish
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                &self.publishes
            }
            CycleOutcome::SourceUnavailable => &self.source_failures,
            CycleOutcome::ReadFailure => &self.read_failures,
            CycleOutcome::DetectionFailure => &self.detection_failures,
            CycleOutcome::Cancelled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn set_backoff(&self, backoff: Option<Duration>) {
        let ms = backoff.map_or(0, |d| d.as_millis() as u64);
        self.backoff_ms.store(ms, Ordering::Relaxed);
    }

    fn set_source_healthy(&self, healthy: bool) {
        self.source_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_publish = *self
            .last_publish
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            detection_failures: self.detection_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            backoff_ms: self.backoff_ms.load(Ordering::Relaxed),
            source_healthy: self.source_healthy.load(Ordering::Relaxed),
            last_publish_age_ms: last_publish.map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

/// Drives one stream until the stop signal fires.
pub struct StreamWorker {
    stream: StreamId,
    source: Box<dyn FrameSource>,
    detector: DetectorHandle,
    store: Arc<DetectionStore>,
    settings: WorkerSettings,
    pacing: Pacing,
    stats: Arc<WorkerStats>,
    shutdown: ShutdownSignal,
    connected: bool,
    consecutive_read_failures: u32,
}

impl StreamWorker {
    pub fn new(
        stream: StreamId,
        source: Box<dyn FrameSource>,
        detector: DetectorHandle,
        store: Arc<DetectionStore>,
        settings: WorkerSettings,
    ) -> Self {
        let pacing = Pacing::new(&settings);
        Self {
            stream,
            source,
            detector,
            store,
            settings,
            pacing,
            stats: Arc::new(WorkerStats::new()),
            shutdown: ShutdownSignal::new(),
            connected: false,
            consecutive_read_failures: 0,
        }
    }

    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Wait the pacing policy assigns to `outcome`, and record it in the stats.
    pub fn next_delay(&mut self, outcome: CycleOutcome) -> Duration {
        let delay = self.pacing.next_delay(outcome);
        self.stats.set_backoff(self.pacing.current_backoff());
        delay
    }

    /// Run exactly one cycle. Errors only when the store rejects the stream,
    /// which ends the worker.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let outcome = self.cycle()?;
        self.stats.record(outcome);
        self.stats
            .set_source_healthy(self.connected && self.source.is_healthy());
        Ok(outcome)
    }

    fn cycle(&mut self) -> Result<CycleOutcome> {
        if self.shutdown.is_triggered() {
            return Ok(CycleOutcome::Cancelled);
        }

        if !self.connected {
            if let Err(err) = self.source.connect() {
                log::warn!("stream {}: {}", self.stream, err);
                return Ok(CycleOutcome::SourceUnavailable);
            }
            log::info!("stream {}: connected to {}", self.stream, self.source.describe());
            self.connected = true;
            self.consecutive_read_failures = 0;
        }

        let frame = match self.source.next_frame() {
            Ok(frame) => {
                self.consecutive_read_failures = 0;
                frame
            }
            Err(err @ SourceError::Unavailable(_)) => {
                log::warn!("stream {}: {}", self.stream, err);
                self.connected = false;
                return Ok(CycleOutcome::SourceUnavailable);
            }
            Err(err @ SourceError::ReadFailure(_)) => {
                self.consecutive_read_failures += 1;
                if self.consecutive_read_failures >= self.settings.max_read_failures {
                    log::warn!(
                        "stream {}: {} ({} consecutive); reconnecting",
                        self.stream,
                        err,
                        self.consecutive_read_failures
                    );
                    self.connected = false;
                    self.consecutive_read_failures = 0;
                    return Ok(CycleOutcome::SourceUnavailable);
                }
                log::warn!("stream {}: {}", self.stream, err);
                return Ok(CycleOutcome::ReadFailure);
            }
        };

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!(
                    "stream {}: detection failed on frame {}: {:#}",
                    self.stream,
                    frame.sequence,
                    err
                );
                return Ok(CycleOutcome::DetectionFailure);
            }
        };
        drop(frame);

        if self.shutdown.is_triggered() {
            return Ok(CycleOutcome::Cancelled);
        }

        let sequence = self
            .store
            .publish(&self.stream, detections)
            .with_context(|| format!("stream {}: publish", self.stream))?;
        log::debug!("stream {}: published #{}", self.stream, sequence);
        Ok(CycleOutcome::Published)
    }

    /// Loop until the stop signal fires.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            "stream {}: worker started (source {}, detector {})",
            self.stream,
            self.source.describe(),
            self.detector.name()
        );
        loop {
            let outcome = self.run_cycle()?;
            if outcome == CycleOutcome::Cancelled {
                break;
            }
            let delay = self.next_delay(outcome);
            if outcome == CycleOutcome::SourceUnavailable {
                log::info!(
                    "stream {}: retrying source in {} ms",
                    self.stream,
                    delay.as_millis()
                );
            }
            if self.shutdown.wait_timeout(delay) {
                break;
            }
        }
        log::info!(
            "stream {}: worker stopped after {} frames",
            self.stream,
            self.source.frames_captured()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionSet, StubBackend};
    use crate::frame::Frame;

    /// Source driven by a script of results; `None` means "return a frame".
    struct ScriptedSource {
        connects: Vec<Result<(), SourceError>>,
        reads: Vec<Option<SourceError>>,
        frames: u64,
    }

    impl ScriptedSource {
        fn new(connects: Vec<Result<(), SourceError>>, reads: Vec<Option<SourceError>>) -> Self {
            Self {
                connects,
                reads,
                frames: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted://test".to_string()
        }

        fn connect(&mut self) -> Result<(), SourceError> {
            if self.connects.is_empty() {
                Ok(())
            } else {
                self.connects.remove(0)
            }
        }

        fn next_frame(&mut self) -> Result<Frame, SourceError> {
            if !self.reads.is_empty() {
                if let Some(err) = self.reads.remove(0) {
                    return Err(err);
                }
            }
            self.frames += 1;
            Ok(Frame::new(vec![0; 12], 2, 2, self.frames))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn frames_captured(&self) -> u64 {
            self.frames
        }
    }

    fn fixture(source: ScriptedSource, labels: &[&str]) -> (StreamWorker, Arc<DetectionStore>) {
        let front = StreamId::new("Front").unwrap();
        let store = Arc::new(DetectionStore::new(vec![front.clone()]).unwrap());
        let detector = DetectorHandle::new(StubBackend::with_labels(labels.iter().copied()));
        let worker = StreamWorker::new(
            front,
            Box::new(source),
            detector,
            store.clone(),
            WorkerSettings::default(),
        );
        (worker, store)
    }

    #[test]
    fn successful_cycle_publishes() {
        let (mut worker, store) = fixture(ScriptedSource::new(vec![], vec![]), &["car"]);
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::Published);
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.detections("Front"),
            Some(&DetectionSet::from_labels(["car"]))
        );
        assert_eq!(worker.stats().snapshot().publishes, 1);
    }

    #[test]
    fn connect_failure_is_unavailable_and_publishes_nothing() {
        let source = ScriptedSource::new(vec![Err(SourceError::unavailable("refused"))], vec![]);
        let (mut worker, store) = fixture(source, &["car"]);
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::SourceUnavailable);
        assert!(!store.snapshot().entry("Front").unwrap().has_data());
        assert!(!worker.stats().snapshot().source_healthy);
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::Published);
        assert!(worker.stats().snapshot().source_healthy);
    }

    #[test]
    fn repeated_read_failures_escalate_to_reconnect() {
        let reads = (0..5)
            .map(|_| Some(SourceError::read_failure("stalled")))
            .collect();
        let (mut worker, _store) = fixture(ScriptedSource::new(vec![], reads), &[]);
        for _ in 0..4 {
            assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::ReadFailure);
        }
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::SourceUnavailable);
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::Published);
    }

    #[test]
    fn cancelled_worker_does_not_publish() {
        let (worker, store) = fixture(ScriptedSource::new(vec![], vec![]), &["car"]);
        let shutdown = ShutdownSignal::new();
        let mut worker = worker.with_shutdown(shutdown.clone());
        shutdown.trigger();
        assert_eq!(worker.run_cycle().unwrap(), CycleOutcome::Cancelled);
        assert!(store.latest(worker.stream()).is_none());
    }

    #[test]
    fn pacing_backs_off_only_for_unavailable_sources() {
        let mut pacing = Pacing::new(&WorkerSettings::default());
        let secs = |d: Duration| d.as_secs();
        assert_eq!(secs(pacing.next_delay(CycleOutcome::SourceUnavailable)), 1);
        assert_eq!(secs(pacing.next_delay(CycleOutcome::SourceUnavailable)), 2);
        assert_eq!(secs(pacing.next_delay(CycleOutcome::ReadFailure)), 1);
        assert_eq!(secs(pacing.next_delay(CycleOutcome::SourceUnavailable)), 4);
        assert_eq!(secs(pacing.next_delay(CycleOutcome::Published)), 1);
        assert_eq!(pacing.current_backoff(), None);
        assert_eq!(secs(pacing.next_delay(CycleOutcome::SourceUnavailable)), 1);
        assert_eq!(pacing.next_delay(CycleOutcome::Cancelled), Duration::ZERO);
    }

    #[test]
    fn stats_track_outcomes() {
        let stats = WorkerStats::new();
        stats.record(CycleOutcome::Published);
        stats.record(CycleOutcome::ReadFailure);
        stats.record(CycleOutcome::DetectionFailure);
        stats.record_restart();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 3);
        assert_eq!(snapshot.publishes, 1);
        assert_eq!(snapshot.read_failures, 1);
        assert_eq!(snapshot.detection_failures, 1);
        assert_eq!(snapshot.restarts, 1);
        assert!(snapshot.last_publish_age_ms.is_some());
    }
}
