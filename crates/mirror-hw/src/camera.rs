//! V4L2 camera frame source via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::orientation::OrientationHandle;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture size. Detection works on a downscaled copy anyway, so a
/// small native format keeps the frame-processing thread ahead of the camera.
const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Longest wait for one frame before the stop flag is checked again.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
/// Consecutive frame timeouts after which the device counts as gone.
const MAX_MISSED_FRAMES: u32 = 5;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Stream frames until `stop` is set or `on_frame` returns false.
    ///
    /// Each frame is stamped with the orientation reading current at capture.
    /// `on_frame` runs on the capture thread and must not block; hand the
    /// frame off and return.
    ///
    /// A device that stops delivering frames without reporting an error is
    /// treated as failed after `MAX_MISSED_FRAMES` timeouts in a row.
    pub fn stream<F>(
        &self,
        orientation: &OrientationHandle,
        stop: &AtomicBool,
        mut on_frame: F,
    ) -> Result<(), CameraError>
    where
        F: FnMut(Frame) -> bool,
    {
        let mut stream = self.open_stream()?;
        let mut stalls = StallWatch::new(MAX_MISSED_FRAMES);

        while !stop.load(Ordering::Relaxed) {
            let dequeued = stream
                .next()
                .map(|(buf, meta)| (self.buf_to_grayscale(buf), meta.sequence));
            let (gray, sequence) = match dequeued {
                Ok(captured) => captured,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    stalls.missed(&self.device_path)?;
                    // A timed-out dequeue leaves the stream's buffer
                    // bookkeeping behind the driver; restart it.
                    drop(stream);
                    stream = self.open_stream()?;
                    continue;
                }
                Err(e) => {
                    return Err(CameraError::CaptureFailed(format!(
                        "failed to dequeue buffer: {e}"
                    )))
                }
            };
            stalls.delivered();

            let gray = match gray {
                Ok(gray) => gray,
                Err(e) => {
                    tracing::debug!(seq = sequence, error = %e, "skipping malformed frame");
                    continue;
                }
            };

            let is_dark = frame::is_dark_frame(&gray, frame::DARK_FRAME_THRESHOLD);
            let frame = Frame {
                data: gray,
                width: self.width,
                height: self.height,
                timestamp: std::time::Instant::now(),
                sequence,
                rotation: orientation.get(),
                is_dark,
            };

            if !on_frame(frame) {
                break;
            }
        }

        tracing::info!(device = %self.device_path, "camera stream stopped");
        Ok(())
    }

    fn open_stream(&self) -> Result<MmapStream<'_>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(FRAME_TIMEOUT);
        Ok(stream)
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, frame::FrameError> {
        let pixels = (self.width * self.height) as usize;
        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(frame::FrameError::InvalidLength {
                        expected: pixels,
                        actual: buf.len(),
                    });
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        }
    }
}

/// Counts frame timeouts in a row.
#[derive(Debug)]
struct StallWatch {
    missed: u32,
    limit: u32,
}

impl StallWatch {
    fn new(limit: u32) -> Self {
        Self {
            missed: 0,
            limit: limit.max(1),
        }
    }

    fn delivered(&mut self) {
        self.missed = 0;
    }

    fn missed(&mut self, device: &str) -> Result<(), CameraError> {
        self.missed += 1;
        tracing::warn!(device, missed = self.missed, "no frame within timeout");
        if self.missed >= self.limit {
            return Err(CameraError::CaptureFailed(format!(
                "{device}: no frames after {} timeouts",
                self.missed
            )));
        }
        Ok(())
    }
}
