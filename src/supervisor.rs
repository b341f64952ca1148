//! Worker lifecycle: one thread per stream, restarted on crash, stopped together.

use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::detect::DetectorHandle;
use crate::ingest::{open_source, FrameSource, SourceSettings};
use crate::shutdown::ShutdownSignal;
use crate::store::DetectionStore;
use crate::stream::StreamId;
use crate::worker::{StreamWorker, WorkerSettings, WorkerStats};

/// Builds a fresh source each time a worker (re)starts.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// One stream the supervisor runs.
#[derive(Clone)]
pub struct StreamSpec {
    pub id: StreamId,
    pub factory: SourceFactory,
}

impl StreamSpec {
    pub fn new<F>(id: StreamId, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        Self {
            id,
            factory: Arc::new(factory),
        }
    }

    /// Spec whose source is opened from `url` by scheme.
    pub fn from_url(id: StreamId, url: impl Into<String>, settings: SourceSettings) -> Self {
        let url = url.into();
        Self::new(id, move || open_source(&url, &settings))
    }
}

impl std::fmt::Debug for StreamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSpec").field("id", &self.id).finish()
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub worker: WorkerSettings,
    /// Pause before a crashed worker is started again. Doubles on each crash
    /// that published nothing, up to `worker.backoff_max`.
    pub restart_delay: Duration,
    /// How often the monitor checks on workers.
    pub monitor_interval: Duration,
    /// Period of the health summary log; `None` disables it.
    pub health_log_interval: Option<Duration>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            restart_delay: Duration::from_secs(2),
            monitor_interval: Duration::from_millis(250),
            health_log_interval: Some(Duration::from_secs(30)),
        }
    }
}

pub struct Supervisor {
    specs: Vec<StreamSpec>,
    store: Arc<DetectionStore>,
    detector: DetectorHandle,
    settings: SupervisorSettings,
}

struct WorkerSlot {
    spec: StreamSpec,
    stats: Arc<WorkerStats>,
    join: Option<JoinHandle<Result<()>>>,
    restart_at: Option<Instant>,
    restart_backoff: Backoff,
    /// Publish count when the current worker was spawned.
    publishes_at_spawn: u64,
}

impl WorkerSlot {
    fn new(spec: StreamSpec, settings: &SupervisorSettings) -> Self {
        Self {
            spec,
            stats: Arc::new(WorkerStats::new()),
            join: None,
            restart_at: None,
            restart_backoff: Backoff::new(settings.restart_delay, settings.worker.backoff_max),
            publishes_at_spawn: 0,
        }
    }

    fn attach(&mut self, join: JoinHandle<Result<()>>) {
        self.join = Some(join);
        self.restart_at = None;
        self.publishes_at_spawn = self.stats.snapshot().publishes;
    }

    /// Pick the wait before the next start. A worker that published since its
    /// last start was healthy for a while, so the spacing starts over.
    fn schedule_restart(&mut self) -> Duration {
        if self.stats.snapshot().publishes > self.publishes_at_spawn {
            self.restart_backoff.reset();
        }
        let delay = self.restart_backoff.next_delay();
        self.restart_at = Some(Instant::now() + delay);
        delay
    }
}

/// Shared state the monitor needs to (re)spawn workers.
#[derive(Clone)]
struct SpawnContext {
    store: Arc<DetectionStore>,
    detector: DetectorHandle,
    worker: WorkerSettings,
    shutdown: ShutdownSignal,
}

impl Supervisor {
    pub fn new(
        specs: Vec<StreamSpec>,
        store: Arc<DetectionStore>,
        detector: DetectorHandle,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            specs,
            store,
            detector,
            settings,
        }
    }

    /// Start one worker per stream, in configured order, plus the monitor.
    pub fn start(self) -> Result<SupervisorHandle> {
        if self.specs.is_empty() {
            return Err(anyhow!("supervisor needs at least one stream"));
        }
        for spec in &self.specs {
            if !self.store.contains(&spec.id) {
                return Err(anyhow!(
                    "stream '{}' has no slot in the detection store",
                    spec.id
                ));
            }
        }

        let shutdown = ShutdownSignal::new();
        let ctx = SpawnContext {
            store: self.store,
            detector: self.detector,
            worker: self.settings.worker.clone(),
            shutdown: shutdown.clone(),
        };

        let mut slots = start_all(&ctx, self.specs, &self.settings, spawn_worker)?;
        let stats = slots
            .iter()
            .map(|slot| (slot.spec.id.clone(), slot.stats.clone()))
            .collect();
        log::info!("supervisor started {} stream workers", slots.len());

        let settings = self.settings;
        let monitor_ctx = ctx.clone();
        let monitor = match std::thread::Builder::new()
            .name("surround-monitor".to_string())
            .spawn(move || monitor(monitor_ctx, slots, settings))
        {
            Ok(monitor) => monitor,
            Err(err) => {
                // The slots moved into the failed closure and were dropped, which
                // detaches the workers; the trigger still stops them.
                ctx.shutdown.trigger();
                return Err(err).context("spawn supervisor monitor");
            }
        };

        Ok(SupervisorHandle {
            shutdown,
            monitor: Some(monitor),
            stats,
        })
    }
}

type Spawner = fn(&SpawnContext, &StreamSpec, Arc<WorkerStats>) -> Result<JoinHandle<Result<()>>>;

/// Spawn a worker per spec. If any spawn fails, the workers already running
/// are stopped and joined before the error is returned.
fn start_all(
    ctx: &SpawnContext,
    specs: Vec<StreamSpec>,
    settings: &SupervisorSettings,
    spawn: Spawner,
) -> Result<Vec<WorkerSlot>> {
    let mut slots = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut slot = WorkerSlot::new(spec, settings);
        match spawn(ctx, &slot.spec, slot.stats.clone()) {
            Ok(join) => slot.attach(join),
            Err(err) => {
                ctx.shutdown.trigger();
                join_all(&mut slots);
                return Err(err);
            }
        }
        slots.push(slot);
    }
    Ok(slots)
}

fn join_all(slots: &mut [WorkerSlot]) {
    for slot in slots.iter_mut() {
        if let Some(join) = slot.join.take() {
            match join.join() {
                Ok(Ok(())) => {}
                other => report_exit(&slot.spec.id, other),
            }
        }
    }
}

fn spawn_worker(
    ctx: &SpawnContext,
    spec: &StreamSpec,
    stats: Arc<WorkerStats>,
) -> Result<JoinHandle<Result<()>>> {
    let ctx = ctx.clone();
    let spec = spec.clone();
    let thread_name = format!("stream-{}", spec.id);
    let spawn_err = format!("spawn worker thread for stream {}", spec.id);
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let source = (spec.factory)()
                .with_context(|| format!("stream {}: open source", spec.id))?;
            StreamWorker::new(
                spec.id.clone(),
                source,
                ctx.detector.for_worker(),
                ctx.store,
                ctx.worker,
            )
            .with_stats(stats)
            .with_shutdown(ctx.shutdown)
            .run()
        })
        .context(spawn_err)
}

fn monitor(ctx: SpawnContext, mut slots: Vec<WorkerSlot>, settings: SupervisorSettings) {
    let mut last_health_log = Instant::now();
    while !ctx.shutdown.wait_timeout(settings.monitor_interval) {
        for slot in slots.iter_mut() {
            if slot.join.as_ref().is_some_and(JoinHandle::is_finished) {
                if let Some(join) = slot.join.take() {
                    report_exit(&slot.spec.id, join.join());
                }
                let delay = slot.schedule_restart();
                log::info!(
                    "stream {}: restarting worker in {} ms",
                    slot.spec.id,
                    delay.as_millis()
                );
            }

            let due = slot.restart_at.is_some_and(|at| Instant::now() >= at);
            if due && !ctx.shutdown.is_triggered() {
                match spawn_worker(&ctx, &slot.spec, slot.stats.clone()) {
                    Ok(join) => {
                        slot.attach(join);
                        slot.stats.record_restart();
                    }
                    Err(err) => {
                        log::error!("{:#}", err);
                        slot.schedule_restart();
                    }
                }
            }
        }

        if let Some(period) = settings.health_log_interval {
            if last_health_log.elapsed() >= period {
                log_health(&slots);
                last_health_log = Instant::now();
            }
        }
    }

    join_all(&mut slots);
    log::info!("supervisor stopped all stream workers");
}

fn report_exit(stream: &StreamId, result: std::thread::Result<Result<()>>) {
    match result {
        Ok(Ok(())) => log::warn!("stream {}: worker exited without a stop request", stream),
        Ok(Err(err)) => log::error!("stream {}: worker failed: {:#}", stream, err),
        Err(panic) => log::error!(
            "stream {}: worker panicked: {}",
            stream,
            panic_message(panic.as_ref())
        ),
    }
}

fn log_health(slots: &[WorkerSlot]) {
    for slot in slots {
        let stats = slot.stats.snapshot();
        log::info!(
            "stream {} health: running={} source_healthy={} cycles={} publishes={} source_failures={} read_failures={} detection_failures={} restarts={} backoff_ms={}",
            slot.spec.id,
            slot.join.is_some(),
            stats.source_healthy,
            stats.cycles,
            stats.publishes,
            stats.source_failures,
            stats.read_failures,
            stats.detection_failures,
            stats.restarts,
            stats.backoff_ms
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Running supervisor. Dropping it stops every worker.
pub struct SupervisorHandle {
    shutdown: ShutdownSignal,
    monitor: Option<JoinHandle<()>>,
    stats: Vec<(StreamId, Arc<WorkerStats>)>,
}

impl SupervisorHandle {
    /// Per-stream counters, in configured order.
    pub fn stats(&self) -> &[(StreamId, Arc<WorkerStats>)] {
        &self.stats
    }

    /// Signal every worker and wait for all of them to exit.
    pub fn stop(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        self.shutdown.trigger();
        if let Some(monitor) = self.monitor.take() {
            monitor
                .join()
                .map_err(|_| anyhow!("supervisor monitor thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_join() {
            log::error!("{:#}", err);
        }
    }
}
