use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use super::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// Shared, lock-guarded access to one detector backend instance.
///
/// Clones point at the same instance, so concurrent `detect` calls through
/// clones are serialized by the mutex. `for_worker` hands out a forked
/// instance instead when the backend supports it.
#[derive(Clone)]
pub struct DetectorHandle {
    name: &'static str,
    backend: Arc<Mutex<Box<dyn DetectorBackend>>>,
}

impl DetectorHandle {
    pub fn new<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            name: backend.name(),
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn detect(&self, frame: &Frame) -> Result<DetectionSet> {
        let mut guard = self.backend.lock().unwrap_or_else(|poisoned| {
            log::warn!(
                "detector '{}' lock poisoned by a panicked call; continuing",
                self.name
            );
            poisoned.into_inner()
        });
        guard.detect(frame)
    }

    pub fn warm_up(&self) -> Result<()> {
        let mut guard = self
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.warm_up()
    }

    /// Handle for one more worker: a forked instance when the backend offers
    /// one, otherwise a clone sharing (and serializing on) this instance.
    pub fn for_worker(&self) -> DetectorHandle {
        let forked = {
            let guard = self
                .backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.fork()
        };
        match forked {
            Some(backend) => Self::from_boxed(backend),
            None => self.clone(),
        }
    }

    /// True when both handles drive the same backend instance.
    pub fn shares_instance_with(&self, other: &DetectorHandle) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("name", &self.name)
            .finish()
    }
}
