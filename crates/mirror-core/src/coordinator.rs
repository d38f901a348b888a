//! Single owner of display state.
//!
//! The coordinator holds the content store, the visibility controller and
//! the latest presence snapshot. Other contexts never touch these; they send
//! `DisplayEvent`s and the coordinator applies them one at a time.

use crate::clock::Clock;
use crate::content::{ApplyOutcome, ContentEntry, ContentStore, FetchOutcome};
use crate::scheduler::ContentSource;
use crate::types::{PresenceEdge, PresenceSnapshot, PresenceState, WidgetId};
use crate::visibility::{DisplaySink, VisibilityController};
use chrono::{Datelike, Utc};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Messages into the presentation context.
#[derive(Debug)]
pub enum DisplayEvent {
    /// Debounced presence transition from the frame pipeline.
    Presence(PresenceEdge),
    /// A finished fetch from the refresh scheduler.
    Content(FetchOutcome),
    /// Forget a widget's cached value.
    Invalidate(WidgetId),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetStatus {
    pub id: WidgetId,
    pub visible: bool,
    #[serde(flatten)]
    pub entry: ContentEntry,
}

/// Published after every handled event, for status queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisplaySnapshot {
    pub presence: PresenceState,
    pub presence_sequence: u64,
    pub widgets: Vec<WidgetStatus>,
}

pub struct Coordinator<S: DisplaySink> {
    store: ContentStore,
    controller: VisibilityController,
    presence: PresenceSnapshot,
    /// Widgets re-rendered from the clock whenever someone arrives.
    live: Vec<(WidgetId, Arc<dyn ContentSource>)>,
    clock: Arc<dyn Clock>,
    sink: S,
    status: watch::Sender<DisplaySnapshot>,
}

impl<S: DisplaySink> Coordinator<S> {
    pub fn new(
        store: ContentStore,
        controller: VisibilityController,
        clock: Arc<dyn Clock>,
        sink: S,
    ) -> (Self, watch::Receiver<DisplaySnapshot>) {
        let (status, rx) = watch::channel(DisplaySnapshot::default());
        let coordinator = Self {
            store,
            controller,
            presence: PresenceSnapshot::default(),
            live: Vec::new(),
            clock,
            sink,
            status,
        };
        coordinator.publish();
        (coordinator, rx)
    }

    /// Re-render `widget` from `source` each time presence turns Present,
    /// so clock-derived text is current when the display wakes.
    pub fn track_clock(&mut self, widget: WidgetId, source: Arc<dyn ContentSource>) {
        self.live.push((widget, source));
    }

    /// Apply one event. `Break` means stop consuming.
    pub fn handle(&mut self, event: DisplayEvent) -> ControlFlow<()> {
        let now = self.clock.now();
        let today = now.weekday();
        match event {
            DisplayEvent::Presence(edge) => {
                if edge.sequence <= self.presence.sequence {
                    tracing::debug!(
                        sequence = edge.sequence,
                        last = self.presence.sequence,
                        "ignoring stale presence edge"
                    );
                    return ControlFlow::Continue(());
                }
                self.presence = edge;
                if edge.state == PresenceState::Present {
                    let at = now.with_timezone(&Utc);
                    for (widget, source) in &self.live {
                        if let Some(value) = source.current(now) {
                            self.store.refresh_value(widget, value, at);
                        }
                    }
                }
                let calls =
                    self.controller
                        .recompute(&self.presence, &self.store, today, &mut self.sink);
                tracing::debug!(state = ?edge.state, calls, "presence applied");
            }
            DisplayEvent::Content(outcome) => {
                let widget = outcome.widget.clone();
                let applied = self.store.apply(outcome);
                if applied.needs_recompute() {
                    self.controller.recompute_widget(
                        &widget,
                        &self.presence,
                        &self.store,
                        today,
                        &mut self.sink,
                    );
                }
                if applied == ApplyOutcome::Changed {
                    tracing::info!(%widget, "content updated");
                }
            }
            DisplayEvent::Invalidate(widget) => {
                if self.store.invalidate(&widget) {
                    self.controller.recompute_widget(
                        &widget,
                        &self.presence,
                        &self.store,
                        today,
                        &mut self.sink,
                    );
                }
            }
            DisplayEvent::Shutdown => return ControlFlow::Break(()),
        }
        self.publish();
        ControlFlow::Continue(())
    }

    /// Consume events until `Shutdown` or until every sender is gone.
    /// Blocks the calling thread.
    pub fn run(mut self, mut events: mpsc::Receiver<DisplayEvent>) -> S {
        tracing::info!("display coordinator started");
        while let Some(event) = events.blocking_recv() {
            if self.handle(event).is_break() {
                break;
            }
        }
        tracing::info!("display coordinator exiting");
        self.sink
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn presence(&self) -> PresenceSnapshot {
        self.presence
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        DisplaySnapshot {
            presence: self.presence.state,
            presence_sequence: self.presence.sequence,
            widgets: self
                .store
                .entries()
                .map(|(id, entry)| WidgetStatus {
                    id: id.clone(),
                    visible: self.controller.is_shown(id),
                    entry: entry.clone(),
                })
                .collect(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }
}
