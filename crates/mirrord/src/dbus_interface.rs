use crate::pipeline::DetectorReload;
use mirror_core::coordinator::{DisplayEvent, DisplaySnapshot};
use mirror_core::{ContentValue, DisplaySink, WidgetId};
use mirror_hw::OrientationHandle;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use zbus::interface;

pub const BUS_NAME: &str = "org.magicmirror.Display1";
pub const OBJECT_PATH: &str = "/org/magicmirror/Display1";
pub const INTERFACE: &str = "org.magicmirror.Display1";

/// D-Bus interface for the mirror display daemon.
///
/// Bus name: org.magicmirror.Display1
/// Object path: /org/magicmirror/Display1
pub struct MirrorService {
    pub status: watch::Receiver<DisplaySnapshot>,
    pub refresh: Arc<Notify>,
    pub orientation: OrientationHandle,
    pub events: mpsc::Sender<DisplayEvent>,
    pub detector: DetectorReload,
}

#[interface(name = "org.magicmirror.Display1")]
impl MirrorService {
    /// Presence and per-widget state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.status.borrow().clone();
        Ok(status_json(&snapshot).to_string())
    }

    /// Per-widget state only, as a JSON array.
    async fn widgets(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.status.borrow().clone();
        serde_json::to_string(&snapshot.widgets).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Start a refresh cycle now instead of waiting for the next tick.
    async fn refresh(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("refresh requested over D-Bus");
        self.refresh.notify_one();
        Ok(true)
    }

    /// Report the device rotation in degrees (0, 90, 180 or 270).
    async fn set_orientation(&self, degrees: u16) -> zbus::fdo::Result<bool> {
        if !matches!(degrees, 0 | 90 | 180 | 270) {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "rotation must be a quarter turn, got {degrees}"
            )));
        }
        self.orientation.set_degrees(degrees);
        Ok(true)
    }

    /// Drop a widget's cached content; it stays hidden until the next
    /// successful fetch.
    async fn invalidate(&self, widget: &str) -> zbus::fdo::Result<bool> {
        let known = self
            .status
            .borrow()
            .widgets
            .iter()
            .any(|w| w.id.as_str() == widget);
        if !known {
            return Err(zbus::fdo::Error::InvalidArgs(format!("unknown widget: {widget}")));
        }
        tracing::info!(widget, "invalidate requested over D-Bus");
        self.events
            .send(DisplayEvent::Invalidate(widget.into()))
            .await
            .map_err(|_| zbus::fdo::Error::Failed("display is shutting down".into()))?;
        Ok(true)
    }

    /// Load the face detection model again, e.g. after installing it.
    /// Takes effect before the next camera frame.
    async fn reload_detector(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("detector reload requested over D-Bus");
        self.detector.request();
        Ok(true)
    }
}

fn status_json(snapshot: &DisplaySnapshot) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "presence": snapshot.presence,
        "presence_sequence": snapshot.presence_sequence,
        "visible": snapshot.widgets.iter().filter(|w| w.visible).count(),
        "widgets": snapshot.widgets,
    })
}

/// Display sink that broadcasts widget changes as D-Bus signals.
///
/// Runs on the presentation thread, outside the async runtime, so it emits
/// through the blocking connection API.
pub struct DbusSink {
    conn: zbus::blocking::Connection,
}

impl DbusSink {
    pub fn new(conn: &zbus::Connection) -> Self {
        Self {
            conn: zbus::blocking::Connection::from(conn.clone()),
        }
    }

    fn emit<B>(&self, signal: &str, body: &B)
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        if let Err(e) = self
            .conn
            .emit_signal(None::<&str>, OBJECT_PATH, INTERFACE, signal, body)
        {
            tracing::warn!(signal, error = %e, "failed to emit D-Bus signal");
        }
    }
}

impl DisplaySink for DbusSink {
    fn set_visible(&mut self, widget: &WidgetId, visible: bool) {
        tracing::debug!(%widget, visible, "VisibilityChanged");
        self.emit("VisibilityChanged", &(widget.as_str(), visible));
    }

    fn set_content(&mut self, widget: &WidgetId, value: &ContentValue) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(%widget, error = %e, "content not serializable");
                return;
            }
        };
        tracing::debug!(%widget, "ContentChanged");
        self.emit("ContentChanged", &(widget.as_str(), json.as_str()));
    }
}
