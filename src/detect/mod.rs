mod backend;
mod backends;
mod result;

pub use backend::Detector;
pub use backends::ReplayDetector;
pub use result::{ObjectClass, TrackedObject};
