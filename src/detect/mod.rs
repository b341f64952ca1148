mod backend;
mod backends;
mod handle;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, COCO_CLASSES};
pub use handle::DetectorHandle;
pub use registry::BackendRegistry;
pub use result::DetectionSet;
