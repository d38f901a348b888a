//! mirror-core — Presence debouncing, content refresh and widget visibility.
//!
//! Face detection runs SCRFD through ONNX Runtime; everything downstream of
//! the detector is plain state owned by the display coordinator.

pub mod clock;
pub mod content;
pub mod coordinator;
pub mod detector;
pub mod presence;
pub mod scheduler;
pub mod scrfd;
pub mod sources;
pub mod types;
pub mod visibility;

pub use clock::{Clock, SystemClock};
pub use content::{ContentStore, FetchOutcome, FetchTicket};
pub use coordinator::{Coordinator, DisplayEvent, DisplaySnapshot};
pub use detector::{FaceDetector, FaceGate};
pub use presence::PresenceAggregator;
pub use scheduler::{ContentSource, FetchError, FetchGate, RefreshScheduler};
pub use types::{BoundingBox, ContentValue, PresenceEdge, PresenceSnapshot, PresenceState, WidgetId};
pub use visibility::{DisplaySink, TracingSink, VisibilityController, VisibilityRule};
