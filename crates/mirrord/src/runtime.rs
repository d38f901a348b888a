use crate::config::Config;
use crate::dbus_interface::{DbusSink, MirrorService, BUS_NAME, OBJECT_PATH};
use crate::pipeline::{spawn_pipeline, PresencePipeline};
use anyhow::{Context, Result};
use mirror_core::coordinator::{Coordinator, DisplayEvent, DisplaySnapshot};
use mirror_core::scrfd::ScrfdDetector;
use mirror_core::{
    Clock, ContentSource, ContentStore, DisplaySink, FaceGate, PresenceAggregator,
    RefreshScheduler, SystemClock, TracingSink, VisibilityController,
};
use mirror_hw::{Camera, CameraError, OrientationHandle, Rotation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the presentation queue. Presence edges are rare and fetch
/// outcomes arrive at most once per widget per cycle.
const DISPLAY_QUEUE: usize = 64;

/// Everything the daemon runs, owned in one place.
pub struct Mirror {
    events: mpsc::Sender<DisplayEvent>,
    cancel: CancellationToken,
    camera_failed: CancellationToken,
    camera_stop: Arc<AtomicBool>,
    camera_thread: thread::JoinHandle<Result<(), CameraError>>,
    pipeline_thread: thread::JoinHandle<()>,
    display_thread: thread::JoinHandle<()>,
    scheduler: Option<JoinHandle<()>>,
    status: watch::Receiver<DisplaySnapshot>,
    _dbus: Option<zbus::Connection>,
}

impl Mirror {
    /// Open the camera, load the detector, wire the three contexts together
    /// and start them.
    ///
    /// Fails fast when the camera cannot be opened or the widgets file is
    /// invalid. A missing detector model only disables presence.
    pub async fn start(config: Config) -> Result<Self> {
        let widgets = config.load_widgets()?;
        let camera = Camera::open(&config.camera_device)
            .with_context(|| format!("opening camera {}", config.camera_device))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let orientation = OrientationHandle::new(Rotation::from_degrees(config.base_rotation));
        let refresh = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let store = ContentStore::new(widgets.iter().map(|w| w.id.clone()));
        let mut controller = VisibilityController::new();
        let mut scheduler = match RefreshScheduler::new(
            config.refresh_period,
            config.fetch_timeout,
            Arc::clone(&clock),
        ) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "content refresh disabled");
                None
            }
        };
        let now = clock.now();
        let mut live = Vec::new();
        for spec in &widgets {
            let (source, rule) = spec.build();
            controller.set_rule(spec.id.clone(), rule);
            if source.current(now).is_some() {
                live.push((spec.id.clone(), Arc::clone(&source)));
            }
            if let Some(s) = scheduler.as_mut() {
                s.register(spec.id.clone(), source, spec.gate);
            }
        }
        tracing::info!(widgets = widgets.len(), "widgets registered");

        let dbus = if config.dbus_enabled {
            match zbus::Connection::session().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "session bus unavailable; logging widget changes instead");
                    None
                }
            }
        } else {
            None
        };
        let sink: Box<dyn DisplaySink> = match &dbus {
            Some(conn) => Box::new(DbusSink::new(conn)),
            None => Box::new(TracingSink),
        };

        let (mut coordinator, status) = Coordinator::new(store, controller, Arc::clone(&clock), sink);
        for (widget, source) in live {
            coordinator.track_clock(widget, source);
        }
        let (events, events_rx) = mpsc::channel(DISPLAY_QUEUE);

        let model_path = config.scrfd_model_path();
        let gate = FaceGate::from_load(ScrfdDetector::load(&model_path), config.min_face_fraction);
        let pipeline = PresencePipeline::new(gate, PresenceAggregator::new(config.debounce_frames));
        let (frames, detector, pipeline_thread) =
            spawn_pipeline(pipeline, events.clone(), move || ScrfdDetector::load(&model_path))
                .context("spawning pipeline thread")?;

        if let Some(conn) = &dbus {
            let service = MirrorService {
                status: status.clone(),
                refresh: Arc::clone(&refresh),
                orientation: orientation.clone(),
                events: events.clone(),
                detector,
            };
            conn.object_server()
                .at(OBJECT_PATH, service)
                .await
                .context("registering D-Bus object")?;
            conn.request_name(BUS_NAME)
                .await
                .with_context(|| format!("acquiring bus name {BUS_NAME}"))?;
            tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus service ready");
        }

        let display_thread = thread::Builder::new()
            .name("mirror-display".into())
            .spawn(move || {
                coordinator.run(events_rx);
            })
            .context("spawning display thread")?;

        let camera_stop = Arc::new(AtomicBool::new(false));
        let camera_failed = CancellationToken::new();
        let camera_thread = {
            let stop = Arc::clone(&camera_stop);
            let failed = camera_failed.clone();
            let orientation = orientation.clone();
            thread::Builder::new()
                .name("mirror-camera".into())
                .spawn(move || {
                    let result = camera.stream(&orientation, &stop, |frame| frames.submit(frame));
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "camera stream failed");
                        failed.cancel();
                    }
                    result
                })
                .context("spawning camera thread")?
        };

        let scheduler = scheduler.map(|s| {
            tokio::spawn(s.run(events.clone(), Arc::clone(&refresh), cancel.clone()))
        });

        tracing::info!(
            camera = %config.camera_device,
            rotation = config.base_rotation,
            debounce = config.debounce_frames,
            "mirrord running"
        );

        Ok(Self {
            events,
            cancel,
            camera_failed,
            camera_stop,
            camera_thread,
            pipeline_thread,
            display_thread,
            scheduler,
            status,
            _dbus: dbus,
        })
    }

    /// Cancelled when the camera stream dies while running.
    pub fn camera_failure(&self) -> CancellationToken {
        self.camera_failed.clone()
    }

    pub fn status(&self) -> DisplaySnapshot {
        self.status.borrow().clone()
    }

    /// Stop every context and wait for it to finish.
    ///
    /// Returns an error if the camera stream failed.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        if let Some(scheduler) = self.scheduler {
            if let Err(e) = scheduler.await {
                tracing::error!(error = %e, "refresh scheduler task failed");
            }
        }

        self.camera_stop.store(true, Ordering::Relaxed);
        let camera_thread = self.camera_thread;
        let pipeline_thread = self.pipeline_thread;
        let camera = tokio::task::spawn_blocking(move || {
            // The camera thread owns the last frame sender; once it is gone the
            // pipeline drains and exits.
            let camera = camera_thread.join();
            let _ = pipeline_thread.join();
            camera
        })
        .await
        .context("joining capture threads")?;

        let _ = self.events.send(DisplayEvent::Shutdown).await;
        let display_thread = self.display_thread;
        tokio::task::spawn_blocking(move || display_thread.join())
            .await
            .context("joining display thread")?
            .map_err(|_| anyhow::anyhow!("display thread panicked"))?;

        tracing::info!("mirrord stopped");
        match camera {
            Ok(result) => result.context("camera stream failed"),
            Err(_) => Err(anyhow::anyhow!("camera thread panicked")),
        }
    }
}
