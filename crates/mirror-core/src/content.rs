//! Latest-value cache for widget content.
//!
//! One entry per registered widget. Entries are only written from fetch
//! outcomes, applied by the single coordinator that owns the store.

use crate::scheduler::FetchError;
use crate::types::{ContentValue, WidgetId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Issued when a fetch starts; later fetches get larger tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FetchTicket(pub u64);

/// Result of one source invocation, as delivered to the store.
#[derive(Debug)]
pub struct FetchOutcome {
    pub widget: WidgetId,
    pub ticket: FetchTicket,
    pub completed_at: DateTime<Utc>,
    pub result: Result<ContentValue, FetchError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentEntry {
    pub value: ContentValue,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when the most recent fetch failed or the value was invalidated.
    pub stale: bool,
    /// Newest fetch applied to this entry.
    pub ticket: Option<FetchTicket>,
}

/// What applying an outcome did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New value differs from the previous one.
    Changed,
    /// Fetch succeeded with the value already held.
    Unchanged,
    /// Fetch failed; previous value kept and marked stale.
    ErrorRecorded,
    /// A newer fetch for this widget was already applied.
    Discarded,
    /// No such widget registered.
    Unknown,
}

impl ApplyOutcome {
    /// Whether the widget's visibility needs recomputing.
    pub fn needs_recompute(self) -> bool {
        !matches!(self, ApplyOutcome::Discarded | ApplyOutcome::Unknown)
    }
}

#[derive(Debug, Default)]
pub struct ContentStore {
    entries: BTreeMap<WidgetId, ContentEntry>,
}

impl ContentStore {
    pub fn new<I>(widgets: I) -> Self
    where
        I: IntoIterator<Item = WidgetId>,
    {
        Self {
            entries: widgets
                .into_iter()
                .map(|w| (w, ContentEntry::default()))
                .collect(),
        }
    }

    /// Apply a fetch outcome with last-writer-wins by fetch-start ticket.
    pub fn apply(&mut self, outcome: FetchOutcome) -> ApplyOutcome {
        let Some(entry) = self.entries.get_mut(&outcome.widget) else {
            tracing::warn!(widget = %outcome.widget, "fetch outcome for unregistered widget");
            return ApplyOutcome::Unknown;
        };

        if entry.ticket.is_some_and(|t| t >= outcome.ticket) {
            tracing::debug!(
                widget = %outcome.widget,
                ticket = outcome.ticket.0,
                "discarding outcome older than applied fetch"
            );
            return ApplyOutcome::Discarded;
        }
        entry.ticket = Some(outcome.ticket);

        match outcome.result {
            Ok(value) => {
                entry.last_success = Some(outcome.completed_at);
                entry.last_error = None;
                entry.stale = false;
                if entry.value == value {
                    ApplyOutcome::Unchanged
                } else {
                    entry.value = value;
                    ApplyOutcome::Changed
                }
            }
            Err(e) => {
                tracing::warn!(widget = %outcome.widget, error = %e, "content fetch failed; keeping last value");
                entry.last_error = Some(e.to_string());
                entry.stale = true;
                ApplyOutcome::ErrorRecorded
            }
        }
    }

    /// Drop the cached value of `widget`. Returns true if the stored value
    /// changed, so the sink needs the now-empty content.
    pub fn invalidate(&mut self, widget: &WidgetId) -> bool {
        let Some(entry) = self.entries.get_mut(widget) else {
            return false;
        };
        entry.stale = true;
        std::mem::take(&mut entry.value) != ContentValue::Empty
    }

    /// Store a value computed locally rather than fetched.
    ///
    /// Counts as a success but leaves the fetch ticket alone, so a fetch
    /// already in flight still lands.
    pub fn refresh_value(
        &mut self,
        widget: &WidgetId,
        value: ContentValue,
        at: DateTime<Utc>,
    ) -> ApplyOutcome {
        let Some(entry) = self.entries.get_mut(widget) else {
            return ApplyOutcome::Unknown;
        };
        entry.last_success = Some(at);
        entry.last_error = None;
        entry.stale = false;
        if entry.value == value {
            ApplyOutcome::Unchanged
        } else {
            entry.value = value;
            ApplyOutcome::Changed
        }
    }

    pub fn get(&self, widget: &WidgetId) -> Option<&ContentEntry> {
        self.entries.get(widget)
    }

    /// Current value, or `Empty` for unknown widgets.
    pub fn value(&self, widget: &WidgetId) -> &ContentValue {
        static EMPTY: ContentValue = ContentValue::Empty;
        self.entries.get(widget).map_or(&EMPTY, |e| &e.value)
    }

    pub fn widgets(&self) -> impl Iterator<Item = &WidgetId> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&WidgetId, &ContentEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(widget: &str, ticket: u64, text: &str) -> FetchOutcome {
        FetchOutcome {
            widget: widget.into(),
            ticket: FetchTicket(ticket),
            completed_at: Utc::now(),
            result: Ok(ContentValue::from(text)),
        }
    }

    fn failed(widget: &str, ticket: u64) -> FetchOutcome {
        FetchOutcome {
            widget: widget.into(),
            ticket: FetchTicket(ticket),
            completed_at: Utc::now(),
            result: Err(FetchError::Failed("503 Service Unavailable".into())),
        }
    }

    fn store() -> ContentStore {
        ContentStore::new(["news".into(), "weather".into()])
    }

    #[test]
    fn test_success_then_failure_keeps_value() {
        let mut s = store();
        let news = WidgetId::from("news");
        assert_eq!(s.apply(ok("news", 1, "Headline A")), ApplyOutcome::Changed);
        assert_eq!(s.apply(failed("news", 2)), ApplyOutcome::ErrorRecorded);

        let entry = s.get(&news).unwrap();
        assert_eq!(entry.value, ContentValue::from("Headline A"));
        assert!(entry.stale);
        assert!(entry.last_error.as_deref().unwrap().contains("503"));
        assert!(entry.last_success.is_some());
    }

    #[test]
    fn test_success_clears_error() {
        let mut s = store();
        s.apply(failed("news", 1));
        assert_eq!(s.apply(ok("news", 2, "Headline B")), ApplyOutcome::Changed);
        let entry = s.get(&"news".into()).unwrap();
        assert!(!entry.stale);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_late_older_fetch_does_not_overwrite() {
        let mut s = store();
        assert_eq!(s.apply(ok("weather", 7, "Rain")), ApplyOutcome::Changed);
        assert_eq!(s.apply(ok("weather", 6, "Sunny")), ApplyOutcome::Discarded);
        assert_eq!(s.apply(failed("weather", 5)), ApplyOutcome::Discarded);
        assert_eq!(s.value(&"weather".into()), &ContentValue::from("Rain"));
        assert!(!s.get(&"weather".into()).unwrap().stale);
    }

    #[test]
    fn test_same_value_is_unchanged() {
        let mut s = store();
        s.apply(ok("weather", 1, "Sunny, 72°"));
        assert_eq!(s.apply(ok("weather", 2, "Sunny, 72°")), ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_unknown_widget_ignored() {
        let mut s = store();
        assert_eq!(s.apply(ok("stock", 1, "$GOOG 140")), ApplyOutcome::Unknown);
        assert!(s.get(&"stock".into()).is_none());
        assert_eq!(s.value(&"stock".into()), &ContentValue::Empty);
    }

    #[test]
    fn test_invalidate_clears_value() {
        let mut s = store();
        s.apply(ok("news", 1, "Headline A"));
        assert!(s.invalidate(&"news".into()));
        assert!(s.value(&"news".into()).is_empty());
        assert!(!s.invalidate(&"news".into()));
    }

    #[test]
    fn test_invalidate_whitespace_text_reports_change() {
        let mut s = store();
        s.apply(ok("news", 1, "   "));
        assert!(s.value(&"news".into()).is_empty());
        assert!(s.invalidate(&"news".into()));
        assert_eq!(s.value(&"news".into()), &ContentValue::Empty);
    }

    #[test]
    fn test_refresh_value_keeps_ticket() {
        let mut s = store();
        let news = WidgetId::from("news");
        s.apply(failed("news", 4));
        assert_eq!(
            s.refresh_value(&news, ContentValue::from("Headline C"), Utc::now()),
            ApplyOutcome::Changed
        );
        let entry = s.get(&news).unwrap();
        assert_eq!(entry.ticket, Some(FetchTicket(4)));
        assert!(!entry.stale);
        assert!(entry.last_error.is_none());
        assert_eq!(s.apply(ok("news", 5, "Headline D")), ApplyOutcome::Changed);
        assert_eq!(
            s.refresh_value(&"stock".into(), ContentValue::from("x"), Utc::now()),
            ApplyOutcome::Unknown
        );
    }

    #[test]
    fn test_every_registered_widget_starts_empty() {
        let s = store();
        assert_eq!(s.widgets().count(), 2);
        assert!(s.entries().all(|(_, e)| e.value.is_empty() && e.ticket.is_none()));
    }
}
