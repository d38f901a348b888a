use mirror_core::coordinator::DisplayEvent;
use mirror_core::detector::DetectorError;
use mirror_core::{FaceDetector, FaceGate, PresenceAggregator, PresenceEdge};
use mirror_hw::{orientation, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames waiting for detection. One slot: while the detector is busy,
/// newer frames replace nothing and are dropped at the camera.
const FRAME_QUEUE: usize = 1;

/// Orientation correction, detection and debouncing for one frame at a time.
pub struct PresencePipeline {
    gate: FaceGate,
    aggregator: PresenceAggregator,
}

impl PresencePipeline {
    pub fn new(gate: FaceGate, aggregator: PresenceAggregator) -> Self {
        Self { gate, aggregator }
    }

    /// Correct `frame` to upright and feed its detection result to the
    /// debouncer. Returns the corrected frame and the presence edge, if this
    /// frame confirmed one.
    ///
    /// Dark frames count as "no face". A detector error drops the frame
    /// without feeding the debouncer.
    pub fn process(&mut self, frame: Frame) -> (Frame, Option<PresenceEdge>) {
        let corrected = orientation::correct(&frame, frame.rotation);

        let detected = if corrected.is_dark {
            false
        } else {
            match self
                .gate
                .detect(&corrected.data, corrected.width, corrected.height)
            {
                Ok(faces) => !faces.is_empty(),
                Err(e) => {
                    tracing::warn!(seq = corrected.sequence, error = %e, "dropping frame");
                    return (corrected, None);
                }
            }
        };

        let edge = self.aggregator.observe(detected, corrected.timestamp);
        (corrected, edge)
    }

    /// Swap in a freshly loaded detector. A failed load keeps the current one.
    pub fn reload<D>(&mut self, loaded: Result<D, DetectorError>) -> bool
    where
        D: FaceDetector + 'static,
    {
        self.gate.reload(loaded)
    }
}

/// Requests a detector reload from the pipeline thread.
///
/// The reload runs on the pipeline thread before the next frame, so the
/// detector is never touched from two threads.
#[derive(Clone, Default)]
pub struct DetectorReload(Arc<AtomicBool>);

impl DetectorReload {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear a pending request, returning whether there was one.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Camera-side handle to the pipeline thread.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Frame>,
}

impl PipelineHandle {
    /// Offer a frame without blocking. A frame arriving while the pipeline is
    /// busy is dropped. Returns false once the pipeline has shut down.
    pub fn submit(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                tracing::trace!(seq = frame.sequence, "pipeline busy; frame dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

fn frame_channel() -> (PipelineHandle, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(FRAME_QUEUE);
    (PipelineHandle { tx }, rx)
}

/// Run the pipeline on a dedicated OS thread.
///
/// Presence edges go to `events`. `load` is called on the pipeline thread
/// whenever a reload is requested through the returned `DetectorReload`.
/// The thread exits when every `PipelineHandle` is dropped or the display
/// side goes away.
pub fn spawn_pipeline<L, D>(
    mut pipeline: PresencePipeline,
    events: mpsc::Sender<DisplayEvent>,
    mut load: L,
) -> std::io::Result<(PipelineHandle, DetectorReload, JoinHandle<()>)>
where
    L: FnMut() -> Result<D, DetectorError> + Send + 'static,
    D: FaceDetector + 'static,
{
    let (handle, mut rx) = frame_channel();
    let reload = DetectorReload::default();
    let requested = reload.clone();

    let thread = std::thread::Builder::new()
        .name("mirror-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            while let Some(frame) = rx.blocking_recv() {
                if requested.take() {
                    tracing::info!("reloading face detector");
                    pipeline.reload(load());
                }
                let (_, edge) = pipeline.process(frame);
                if let Some(edge) = edge {
                    if events.blocking_send(DisplayEvent::Presence(edge)).is_err() {
                        break;
                    }
                }
            }
            tracing::info!("pipeline thread exiting");
        })?;

    Ok((handle, reload, thread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{BoundingBox, PresenceState};
    use mirror_hw::Rotation;
    use std::sync::atomic::AtomicUsize;

    /// Reports a face whenever the frame's top-left pixel is bright.
    struct MarkerDetector {
        calls: Arc<AtomicUsize>,
    }

    impl FaceDetector for MarkerDetector {
        fn detect(
            &mut self,
            gray: &[u8],
            width: u32,
            height: u32,
            _min_size: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if gray[0] > 128 {
                Ok(vec![BoundingBox { x: 0, y: 0, width: width / 2, height: height / 2 }])
            } else {
                Ok(vec![])
            }
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&mut self, _: &[u8], _: u32, _: u32, _: u32) -> Result<Vec<BoundingBox>, DetectorError> {
            Err(DetectorError::InferenceFailed("bad output shape".into()))
        }
    }

    fn pipeline(k: u32) -> (PresencePipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = FaceGate::from_load(Ok(MarkerDetector { calls: Arc::clone(&calls) }), 0.1);
        (PresencePipeline::new(gate, PresenceAggregator::new(k)), calls)
    }

    /// 4x4 mid-grey frame; `face` puts a bright marker in the corner.
    fn frame(face: bool) -> Frame {
        let mut data = vec![100u8; 16];
        if face {
            data[0] = 255;
        }
        Frame::from_gray(data, 4, 4).unwrap()
    }

    #[test]
    fn test_edge_after_debounce() {
        let (mut p, _) = pipeline(3);
        let edges: Vec<_> = [true, false, true, true, true]
            .into_iter()
            .filter_map(|f| p.process(frame(f)).1)
            .collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].state, PresenceState::Present);
    }

    #[test]
    fn test_frame_corrected_before_detection() {
        let (mut p, _) = pipeline(1);
        // Marker in the bottom-right corner; a 180° reading brings it to the top-left.
        let mut data = vec![100u8; 16];
        data[15] = 255;
        let mut f = Frame::from_gray(data, 4, 4).unwrap();
        f.rotation = Rotation::Deg180;

        let (corrected, edge) = p.process(f);
        assert_eq!(corrected.data[0], 255);
        assert_eq!(corrected.rotation, Rotation::Deg0);
        assert!(edge.is_some());
    }

    #[test]
    fn test_dark_frame_skips_detector() {
        let (mut p, calls) = pipeline(1);
        let dark = Frame::from_gray(vec![0u8; 16], 4, 4).unwrap();
        assert!(dark.is_dark);
        assert!(p.process(dark).1.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detector_error_drops_frame() {
        let gate = FaceGate::from_load(Ok(FailingDetector), 0.1);
        let mut p = PresencePipeline::new(gate, PresenceAggregator::new(1));
        let (_, edge) = p.process(frame(true));
        assert!(edge.is_none());
    }

    #[test]
    fn test_missing_model_never_reports_presence() {
        let gate = FaceGate::unavailable(0.1);
        let mut p = PresencePipeline::new(gate, PresenceAggregator::new(1));
        assert!((0..10).all(|_| p.process(frame(true)).1.is_none()));
    }

    #[test]
    fn test_failed_reload_keeps_detector() {
        let (mut p, calls) = pipeline(1);
        assert!(!p.reload(Err::<FailingDetector, _>(DetectorError::ModelNotFound("det_10g.onnx".into()))));
        assert!(p.process(frame(true)).1.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Offer `frame` until the pipeline thread has room for it.
    fn submit_blocking(handle: &PipelineHandle, frame: Frame) {
        let mut pending = Some(frame);
        while let Some(fr) = pending.take() {
            match handle.tx.try_send(fr) {
                Ok(()) => {}
                Err(TrySendError::Full(fr)) => {
                    pending = Some(fr);
                    std::thread::yield_now();
                }
                Err(TrySendError::Closed(_)) => panic!("pipeline exited early"),
            }
        }
    }

    #[test]
    fn test_submit_drops_when_busy() {
        let (handle, mut rx) = frame_channel();
        assert!(handle.submit(frame(true)));
        assert!(handle.submit(frame(false)));
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.data[0], 255);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!handle.submit(frame(true)));
    }

    #[test]
    fn test_thread_forwards_edges() {
        let (p, _) = pipeline(1);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (handle, _reload, thread) =
            spawn_pipeline(p, events_tx, || Err::<FailingDetector, _>(DetectorError::ModelNotFound("unused".into())))
                .unwrap();

        for f in [true, false] {
            submit_blocking(&handle, frame(f));
        }
        drop(handle);
        thread.join().unwrap();

        let mut states = Vec::new();
        while let Ok(DisplayEvent::Presence(edge)) = events_rx.try_recv() {
            states.push(edge.state);
        }
        assert_eq!(states, vec![PresenceState::Present, PresenceState::Absent]);
    }

    #[test]
    fn test_requested_reload_enables_presence() {
        let gate = FaceGate::unavailable(0.1);
        let p = PresencePipeline::new(gate, PresenceAggregator::new(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let loads = Arc::new(AtomicUsize::new(0));
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (handle, reload, thread) = {
            let calls = Arc::clone(&calls);
            let loads = Arc::clone(&loads);
            spawn_pipeline(p, events_tx, move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(MarkerDetector { calls: Arc::clone(&calls) })
            })
            .unwrap()
        };

        submit_blocking(&handle, frame(true));
        reload.request();
        submit_blocking(&handle, frame(true));
        drop(handle);
        thread.join().unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(calls.load(Ordering::SeqCst) >= 1);
        match events_rx.try_recv() {
            Ok(DisplayEvent::Presence(edge)) => assert_eq!(edge.state, PresenceState::Present),
            other => panic!("expected a presence edge, got {other:?}"),
        }
    }
}
