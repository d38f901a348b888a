//! Fixed-rate refresh of widget content.
//!
//! Every cycle invokes each registered source once, as its own task. A slow,
//! failing or panicking source only affects its own widget; the next cycle
//! fires on schedule regardless of what earlier fetches are still doing.

use crate::clock::Clock;
use crate::content::{FetchOutcome, FetchTicket};
use crate::coordinator::DisplayEvent;
use crate::types::{ContentValue, WidgetId};
use chrono::{DateTime, Datelike, Local, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::{self, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<ContentValue, FetchError>> + Send + 'a>>;

/// Supplies the content of one widget.
///
/// Called once per refresh cycle; must tolerate repeated and overlapping
/// invocations. Synchronous sources return a ready future.
pub trait ContentSource: Send + Sync {
    fn fetch(&self, now: DateTime<Local>) -> FetchFuture<'_>;

    /// Content derived from the clock alone, for sources that can answer
    /// without fetching. Lets the display re-render them on demand instead
    /// of waiting for the next refresh tick.
    fn current(&self, _now: DateTime<Local>) -> Option<ContentValue> {
        None
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{0}")]
    Failed(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("source panicked")]
    Panicked,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("refresh period must be non-zero")]
    InvalidPeriod,
}

/// Condition under which a source is fetched at all.
///
/// A closed gate skips the source for that cycle; its entry is left as is
/// and nothing is recorded as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchGate {
    #[default]
    Always,
    /// Monday to Friday.
    Weekdays,
    /// Monday to Friday, from the given local hour onwards.
    WeekdaysAfter(u32),
}

impl FetchGate {
    pub fn allows(&self, now: DateTime<Local>) -> bool {
        let weekday = !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        match *self {
            FetchGate::Always => true,
            FetchGate::Weekdays => weekday,
            FetchGate::WeekdaysAfter(hour) => weekday && now.hour() >= hour,
        }
    }
}

struct RegisteredSource {
    widget: WidgetId,
    source: Arc<dyn ContentSource>,
    gate: FetchGate,
}

/// Fetches that have started but not yet been reported.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Result<ContentValue, FetchError>>,
    pending: HashMap<task::Id, (WidgetId, FetchTicket)>,
}

impl InFlight {
    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next finished fetch. Panics are reported as `FetchError::Panicked`;
    /// aborted fetches are dropped silently.
    async fn next(&mut self) -> Option<FetchOutcome> {
        loop {
            let (id, result) = match self.tasks.join_next_with_id().await? {
                Ok((id, result)) => (id, result),
                Err(e) if e.is_panic() => (e.id(), Err(FetchError::Panicked)),
                Err(e) => {
                    self.pending.remove(&e.id());
                    continue;
                }
            };
            let Some((widget, ticket)) = self.pending.remove(&id) else {
                continue;
            };
            return Some(FetchOutcome {
                widget,
                ticket,
                completed_at: Utc::now(),
                result,
            });
        }
    }

    fn abort_all(&mut self) {
        self.tasks.abort_all();
        self.pending.clear();
    }
}

pub struct RefreshScheduler {
    sources: Vec<RegisteredSource>,
    period: Duration,
    fetch_timeout: Duration,
    clock: Arc<dyn Clock>,
    next_ticket: u64,
}

impl RefreshScheduler {
    pub fn new(
        period: Duration,
        fetch_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidPeriod);
        }
        Ok(Self {
            sources: Vec::new(),
            period,
            fetch_timeout,
            clock,
            next_ticket: 0,
        })
    }

    pub fn register(&mut self, widget: WidgetId, source: Arc<dyn ContentSource>, gate: FetchGate) {
        self.sources.push(RegisteredSource { widget, source, gate });
    }

    pub fn widgets(&self) -> impl Iterator<Item = &WidgetId> {
        self.sources.iter().map(|s| &s.widget)
    }

    /// Run one full cycle and wait for every fetch to finish.
    pub async fn run_cycle(&mut self) -> Vec<FetchOutcome> {
        let mut in_flight = InFlight::default();
        self.start_cycle(&mut in_flight);
        let mut outcomes = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Refresh on a fixed-rate grid until cancelled: immediately, then every
    /// `period` after the start. `trigger` requests an extra cycle.
    ///
    /// Outcomes are forwarded to the coordinator in completion order. On
    /// cancellation in-flight fetches are aborted and never reported.
    pub async fn run(
        mut self,
        events: mpsc::Sender<DisplayEvent>,
        trigger: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = InFlight::default();

        tracing::info!(
            period_secs = self.period.as_secs(),
            sources = self.sources.len(),
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.start_cycle(&mut in_flight),
                _ = trigger.notified() => {
                    tracing::info!("manual refresh requested");
                    self.start_cycle(&mut in_flight);
                }
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    if events.send(DisplayEvent::Content(outcome)).await.is_err() {
                        tracing::warn!("display coordinator gone; stopping refresh");
                        break;
                    }
                }
            }
        }

        let abandoned = in_flight.pending.len();
        in_flight.abort_all();
        tracing::info!(abandoned, "refresh scheduler stopped");
    }

    fn start_cycle(&mut self, in_flight: &mut InFlight) {
        let now = self.clock.now();
        let mut started = 0usize;

        for reg in &self.sources {
            if !reg.gate.allows(now) {
                tracing::debug!(widget = %reg.widget, gate = ?reg.gate, "fetch gated off");
                continue;
            }

            self.next_ticket += 1;
            let ticket = FetchTicket(self.next_ticket);
            let source = Arc::clone(&reg.source);
            let timeout = self.fetch_timeout;

            let handle = in_flight.tasks.spawn(async move {
                match tokio::time::timeout(timeout, source.fetch(now)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::TimedOut(timeout)),
                }
            });
            in_flight.pending.insert(handle.id(), (reg.widget.clone(), ticket));
            started += 1;
        }

        tracing::debug!(started, in_flight = in_flight.pending.len(), "refresh cycle started");
    }
}
