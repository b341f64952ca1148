use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use surround_detect::{
    open_source, DetectionStore, DetectorHandle, Frame, FrameSource, SourceError, SourceSettings,
    StreamId, StreamSpec, StubBackend, Supervisor, SupervisorSettings, WorkerSettings,
};

const INTERVAL: Duration = Duration::from_millis(50);

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        worker: WorkerSettings {
            interval: INTERVAL,
            read_retry: Duration::from_millis(20),
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            ..WorkerSettings::default()
        },
        restart_delay: Duration::from_millis(30),
        monitor_interval: Duration::from_millis(10),
        health_log_interval: None,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// Connects fine, then panics on the first read.
struct PanickingSource;

impl FrameSource for PanickingSource {
    fn describe(&self) -> String {
        "test://panicking".to_string()
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        panic!("decoder blew up");
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn frames_captured(&self) -> u64 {
        0
    }
}

#[test]
fn stop_ends_all_workers_promptly_and_publishing_stops() -> Result<()> {
    let ids: Vec<StreamId> = ["Front", "Left", "Right"]
        .iter()
        .map(|id| StreamId::new(*id))
        .collect::<Result<_>>()?;
    let store = Arc::new(DetectionStore::new(ids.clone())?);
    let specs = ids
        .iter()
        .map(|id| {
            StreamSpec::from_url(
                id.clone(),
                format!("stub://{}", id.as_str().to_lowercase()),
                SourceSettings::default(),
            )
        })
        .collect();

    let handle = Supervisor::new(
        specs,
        store.clone(),
        DetectorHandle::new(StubBackend::with_labels(["car"])),
        settings(),
    )
    .start()?;

    assert!(wait_until(Duration::from_secs(5), || {
        store.snapshot().iter().all(|entry| entry.has_data())
    }));

    let started = Instant::now();
    handle.stop()?;
    assert!(started.elapsed() < INTERVAL + Duration::from_secs(1));

    let sequences: Vec<_> = ids
        .iter()
        .map(|id| store.latest(id).map(|p| p.sequence))
        .collect();
    std::thread::sleep(INTERVAL * 3);
    let after: Vec<_> = ids
        .iter()
        .map(|id| store.latest(id).map(|p| p.sequence))
        .collect();
    assert_eq!(sequences, after);
    Ok(())
}

#[test]
fn crashed_worker_is_restarted_with_a_fresh_source() -> Result<()> {
    let front = StreamId::new("Front")?;
    let left = StreamId::new("Left")?;
    let store = Arc::new(DetectionStore::new(vec![front.clone(), left.clone()])?);

    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let flaky = StreamSpec::new(front.clone(), move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Box::new(PanickingSource) as Box<dyn FrameSource>)
        } else {
            open_source("stub://front_camera", &SourceSettings::default())
        }
    });
    let steady = StreamSpec::from_url(left.clone(), "stub://left_camera", SourceSettings::default());

    let handle = Supervisor::new(
        vec![flaky, steady],
        store.clone(),
        DetectorHandle::new(StubBackend::with_labels(["person"])),
        settings(),
    )
    .start()?;

    assert!(wait_until(Duration::from_secs(5), || store.latest(&front).is_some()));
    assert!(opened.load(Ordering::SeqCst) >= 2);

    let stats = handle.stats();
    assert_eq!(stats[0].0, front);
    assert!(wait_until(Duration::from_secs(1), || {
        stats[0].1.snapshot().restarts == 1
    }));
    assert_eq!(stats[1].1.snapshot().restarts, 0);
    assert!(wait_until(Duration::from_secs(5), || store.latest(&left).is_some()));

    handle.stop()?;
    Ok(())
}
