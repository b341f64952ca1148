use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// Stub backend for demos and testing. Replays a fixed script of detection
/// sets, one per call, wrapping around at the end.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: Vec<DetectionSet>,
    calls: usize,
}

impl StubBackend {
    /// Detects nothing on every frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports the same labels on every frame.
    pub fn with_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(vec![DetectionSet::from_labels(labels)])
    }

    /// Reports `script[n % len]` on the n-th call.
    pub fn with_script(script: Vec<DetectionSet>) -> Self {
        Self { script, calls: 0 }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionSet> {
        let result = if self.script.is_empty() {
            DetectionSet::new()
        } else {
            self.script[self.calls % self.script.len()].clone()
        };
        self.calls += 1;
        Ok(result)
    }

    fn fork(&self) -> Option<Box<dyn DetectorBackend>> {
        Some(Box::new(Self::with_script(self.script.clone())))
    }
}
