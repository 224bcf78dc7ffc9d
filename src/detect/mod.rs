mod backend;
mod backends;
mod detector;
mod nms;
mod result;

pub use backend::{InferenceBackend, RawDetection};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use detector::{
    load_backend, read_class_names, BackendLoader, Detector, CONFIDENCE_THRESHOLD,
    NMS_IOU_THRESHOLD, NMS_SCORE_THRESHOLD,
};
pub use nms::non_max_suppression;
pub use result::{vehicle_label, BoundingBox, Detection, DetectionResult, VEHICLE_CLASSES};
