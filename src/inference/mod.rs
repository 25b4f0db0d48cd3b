//! Detection pipeline: busy gate, detector backends, scheduler and results

pub mod detector;
pub mod gate;
pub mod result;
pub mod scheduler;
pub mod snapshot;

pub use detector::{BlockingDetector, Detector, DetectorError, HttpDetector};
pub use gate::{BusyGate, BusyGuard};
pub use result::{AnomalyClasses, Detection, InferenceResult, RawDetection, ResultStore};
pub use scheduler::{InferenceScheduler, SchedulerSettings};
