use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifier of a display widget ("weather", "news", "water_plants", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WidgetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Face bounding box in corrected-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// True when both sides reach `min_size` pixels.
    pub fn reaches(&self, min_size: u32) -> bool {
        self.width >= min_size && self.height >= min_size
    }
}

/// Latest displayable value of a widget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContentValue {
    #[default]
    Empty,
    Text(String),
    /// Multi-line content, e.g. a calendar title followed by its details.
    Lines(Vec<String>),
    /// Remote image, e.g. today's comic.
    ImageUrl(String),
}

impl ContentValue {
    /// Whitespace-only text counts as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            ContentValue::Empty => true,
            ContentValue::Text(text) | ContentValue::ImageUrl(text) => text.trim().is_empty(),
            ContentValue::Lines(lines) => lines.iter().all(|l| l.trim().is_empty()),
        }
    }
}

impl From<&str> for ContentValue {
    fn from(text: &str) -> Self {
        ContentValue::Text(text.to_string())
    }
}

/// Debounced presence state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Absent,
    Present,
}

/// Read-only copy of the aggregator's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub state: PresenceState,
    /// Number of transitions so far; 0 until the first edge.
    pub sequence: u64,
    /// Capture time of the frame that confirmed the last transition.
    pub since: Option<Instant>,
}

impl PresenceSnapshot {
    pub fn is_present(&self) -> bool {
        self.state == PresenceState::Present
    }
}

/// Emitted by the presence aggregator on each confirmed transition.
pub type PresenceEdge = PresenceSnapshot;
