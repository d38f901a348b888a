//! mirror-hw — Camera frame source and orientation correction.
//!
//! Provides V4L2-based continuous capture and the upright-rotation step that
//! runs before face detection.

pub mod camera;
pub mod frame;
pub mod orientation;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::Frame;
pub use orientation::{OrientationHandle, Rotation};
