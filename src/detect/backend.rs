use anyhow::Result;

use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend maps one frame to the set of object classes visible in it. It may
/// keep internal state (model buffers, counters), which is why `detect` takes
/// `&mut self`; callers reach it through a `DetectorHandle`, which serializes
/// calls unless the backend can `fork` an independent instance.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations treat the pixels as read-only and must not retain them
    /// past the call.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// An independent instance safe to drive from another thread in parallel.
    ///
    /// `None` (the default) means all workers share this instance and their
    /// calls are serialized.
    fn fork(&self) -> Option<Box<dyn DetectorBackend>> {
        None
    }
}
