use anyhow::{Context, Result};
use mirror_core::sources::{default_widgets, WidgetSpec, WidgetsFile};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD model.
    pub model_dir: PathBuf,
    /// Consecutive agreeing frames before presence changes.
    pub debounce_frames: u32,
    /// Minimum face height as a fraction of the frame height.
    pub min_face_fraction: f32,
    pub refresh_period: Duration,
    pub fetch_timeout: Duration,
    /// Publish widget state on the session bus.
    pub dbus_enabled: bool,
    /// Device rotation in degrees until told otherwise over D-Bus.
    pub base_rotation: u16,
    /// TOML widget definitions; built-in defaults when unset.
    pub widgets_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `MIRROR_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_dir = var("MIRROR_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("mirror/models")
            });

        Self {
            camera_device: var("MIRROR_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            debounce_frames: parsed(&var, "MIRROR_DEBOUNCE_FRAMES", mirror_core::presence::DEFAULT_DEBOUNCE_FRAMES),
            min_face_fraction: parsed(
                &var,
                "MIRROR_MIN_FACE_FRACTION",
                mirror_core::detector::DEFAULT_MIN_FACE_FRACTION,
            ),
            refresh_period: Duration::from_secs(parsed(&var, "MIRROR_REFRESH_SECS", 60 * 60)),
            fetch_timeout: Duration::from_secs(parsed(&var, "MIRROR_FETCH_TIMEOUT_SECS", 30)),
            dbus_enabled: var("MIRROR_DBUS_ENABLED").map(|v| v != "0").unwrap_or(true),
            base_rotation: parsed(&var, "MIRROR_ROTATION", 0),
            widgets_file: var("MIRROR_WIDGETS").map(PathBuf::from),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Widget definitions from `widgets_file`, or the built-in set.
    pub fn load_widgets(&self) -> Result<Vec<WidgetSpec>> {
        match &self.widgets_file {
            Some(path) => load_widgets_file(path),
            None => Ok(default_widgets()),
        }
    }
}

fn load_widgets_file(path: &Path) -> Result<Vec<WidgetSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading widgets file {}", path.display()))?;
    let file: WidgetsFile =
        toml::from_str(&text).with_context(|| format!("parsing widgets file {}", path.display()))?;
    if file.widgets.is_empty() {
        tracing::warn!(path = %path.display(), "widgets file defines no widgets");
    }
    Ok(file.widgets)
}

fn parsed<F, T>(var: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}
