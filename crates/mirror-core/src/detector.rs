//! Face detection capability and the fail-open gate around it.

use crate::types::BoundingBox;
use thiserror::Error;

/// Default minimum face size as a fraction of frame height.
pub const DEFAULT_MIN_FACE_FRACTION: f32 = 0.10;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detector over grayscale frames.
///
/// Implementations may keep per-session state (an inference session, scratch
/// buffers), hence `&mut self`. They are driven from a single thread and
/// never called concurrently.
pub trait FaceDetector: Send {
    /// Detect faces no smaller than `min_size` pixels on either side.
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        min_size: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Fail-open wrapper around an optional detector.
///
/// With no working detector every frame reports no faces, so the display
/// stays hidden instead of the pipeline failing.
pub struct FaceGate {
    detector: Option<Box<dyn FaceDetector>>,
    min_face_fraction: f32,
}

impl FaceGate {
    /// Wrap the result of loading a detector. A load failure is logged once
    /// here and never retried.
    pub fn from_load<D>(loaded: Result<D, DetectorError>, min_face_fraction: f32) -> Self
    where
        D: FaceDetector + 'static,
    {
        let mut gate = Self {
            detector: None,
            min_face_fraction: min_face_fraction.clamp(0.05, 0.5),
        };
        gate.reload(loaded);
        gate
    }

    /// A gate with no detector; always reports no faces.
    pub fn unavailable(min_face_fraction: f32) -> Self {
        Self {
            detector: None,
            min_face_fraction: min_face_fraction.clamp(0.05, 0.5),
        }
    }

    /// Replace the current detector with a freshly loaded one.
    ///
    /// On failure the previous detector (if any) is kept.
    pub fn reload<D>(&mut self, loaded: Result<D, DetectorError>) -> bool
    where
        D: FaceDetector + 'static,
    {
        match loaded {
            Ok(detector) => {
                self.detector = Some(Box::new(detector));
                tracing::info!("face detector ready");
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "face detector unavailable; presence stays absent"
                );
                false
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.detector.is_some()
    }

    /// Smallest face side accepted for a frame of `height` rows.
    pub fn min_face_size(&self, height: u32) -> u32 {
        ((height as f32) * self.min_face_fraction).floor() as u32
    }

    /// Run detection on one corrected frame.
    ///
    /// Returns `Ok(vec![])` when no detector is loaded. Errors from a loaded
    /// detector belong to this frame only; the caller drops the frame.
    pub fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let min_size = self.min_face_size(height);
        let Some(detector) = self.detector.as_mut() else {
            return Ok(Vec::new());
        };
        let mut faces = detector.detect(gray, width, height, min_size)?;
        faces.retain(|b| b.reaches(min_size));
        Ok(faces)
    }
}
