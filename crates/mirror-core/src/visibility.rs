//! Widget visibility derived from presence and content.
//!
//! A widget is visible exactly when someone is present, its content is
//! non-empty and its rule holds today. The controller remembers what the
//! sink was last told and only sends differences.

use crate::content::ContentStore;
use crate::types::{ContentValue, PresenceSnapshot, WidgetId};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Where widget state ends up (a renderer, a bus, a log).
///
/// Calls may be costly on the far side (layout pass, image load), so the
/// controller never repeats a call with unchanged arguments.
pub trait DisplaySink: Send {
    fn set_visible(&mut self, widget: &WidgetId, visible: bool);
    fn set_content(&mut self, widget: &WidgetId, value: &ContentValue);
}

impl<S: DisplaySink + ?Sized> DisplaySink for Box<S> {
    fn set_visible(&mut self, widget: &WidgetId, visible: bool) {
        (**self).set_visible(widget, visible);
    }

    fn set_content(&mut self, widget: &WidgetId, value: &ContentValue) {
        (**self).set_content(widget, value);
    }
}

/// Sink that only logs; used when no display bus is available.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DisplaySink for TracingSink {
    fn set_visible(&mut self, widget: &WidgetId, visible: bool) {
        tracing::info!(%widget, visible, "widget visibility");
    }

    fn set_content(&mut self, widget: &WidgetId, value: &ContentValue) {
        tracing::info!(%widget, ?value, "widget content");
    }
}

/// Extra, content-independent condition for showing a widget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityRule {
    #[default]
    Always,
    /// Only on these days, e.g. a "water the plants" reminder.
    ScheduledDays(Vec<Weekday>),
}

impl VisibilityRule {
    pub fn holds(&self, today: Weekday) -> bool {
        match self {
            VisibilityRule::Always => true,
            VisibilityRule::ScheduledDays(days) => days.contains(&today),
        }
    }
}

pub type VisibilityDecision = BTreeMap<WidgetId, bool>;

#[derive(Debug, Default)]
pub struct VisibilityController {
    rules: HashMap<WidgetId, VisibilityRule>,
    /// Visibility last sent to the sink; absent means hidden.
    shown: HashMap<WidgetId, bool>,
    /// Content last sent to the sink; absent means nothing sent.
    pushed: HashMap<WidgetId, ContentValue>,
}

impl VisibilityController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rule(&mut self, widget: WidgetId, rule: VisibilityRule) {
        self.rules.insert(widget, rule);
    }

    /// Whether `widget` should be visible given these inputs.
    pub fn visible(
        &self,
        widget: &WidgetId,
        presence: &PresenceSnapshot,
        store: &ContentStore,
        today: Weekday,
    ) -> bool {
        presence.is_present()
            && !store.value(widget).is_empty()
            && self.rules.get(widget).map_or(true, |r| r.holds(today))
    }

    /// Full decision for every registered widget. Pure.
    pub fn decide(
        &self,
        presence: &PresenceSnapshot,
        store: &ContentStore,
        today: Weekday,
    ) -> VisibilityDecision {
        store
            .widgets()
            .map(|w| (w.clone(), self.visible(w, presence, store, today)))
            .collect()
    }

    /// Bring the sink in line with the current inputs for all widgets.
    /// Returns the number of sink calls made.
    pub fn recompute(
        &mut self,
        presence: &PresenceSnapshot,
        store: &ContentStore,
        today: Weekday,
        sink: &mut dyn DisplaySink,
    ) -> usize {
        let widgets: Vec<WidgetId> = store.widgets().cloned().collect();
        widgets
            .iter()
            .map(|w| self.recompute_widget(w, presence, store, today, sink))
            .sum()
    }

    /// Bring the sink in line for one widget. Content goes out before a
    /// widget is shown so it never appears with stale text.
    pub fn recompute_widget(
        &mut self,
        widget: &WidgetId,
        presence: &PresenceSnapshot,
        store: &ContentStore,
        today: Weekday,
        sink: &mut dyn DisplaySink,
    ) -> usize {
        let mut calls = 0;

        let value = store.value(widget);
        let last = self.pushed.get(widget);
        let content_changed = match last {
            Some(last) => last != value,
            None => !value.is_empty(),
        };
        if content_changed {
            sink.set_content(widget, value);
            self.pushed.insert(widget.clone(), value.clone());
            calls += 1;
        }

        let visible = self.visible(widget, presence, store, today);
        let was_visible = self.shown.get(widget).copied().unwrap_or(false);
        if visible != was_visible {
            sink.set_visible(widget, visible);
            self.shown.insert(widget.clone(), visible);
            calls += 1;
        }

        calls
    }

    pub fn is_shown(&self, widget: &WidgetId) -> bool {
        self.shown.get(widget).copied().unwrap_or(false)
    }
}
