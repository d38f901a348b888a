//! Built-in content sources and widget definitions.
//!
//! Anything network-bound (weather, news, quotes, calendar, comics) runs as
//! an external command; the daemon only renders its output.

use crate::scheduler::{ContentSource, FetchError, FetchFuture, FetchGate};
use crate::types::{ContentValue, WidgetId};
use crate::visibility::VisibilityRule;
use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// How the day of month is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStyle {
    /// "Friday the 16th"
    #[default]
    Us,
    /// "Friday, 16 October"
    International,
}

/// Today's weekday and date.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaySource {
    pub style: DayStyle,
}

impl DaySource {
    pub fn render(&self, now: DateTime<Local>) -> String {
        let weekday = now.format("%A");
        let day = now.day();
        match self.style {
            DayStyle::Us => format!("{weekday} the {day}{}", ordinal_suffix(day)),
            DayStyle::International => format!("{weekday}, {day} {}", now.format("%B")),
        }
    }
}

fn ordinal_suffix(day: u32) -> &'static str {
    if (11..=13).contains(&day) {
        return "th";
    }
    match day % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

impl ContentSource for DaySource {
    fn fetch(&self, now: DateTime<Local>) -> FetchFuture<'_> {
        Box::pin(future::ready(Ok(ContentValue::Text(self.render(now)))))
    }

    fn current(&self, now: DateTime<Local>) -> Option<ContentValue> {
        Some(ContentValue::Text(self.render(now)))
    }
}

/// Time-of-day welcome addressed to the household.
#[derive(Debug, Clone, Default)]
pub struct GreetingSource {
    pub owners: Option<String>,
}

impl GreetingSource {
    pub fn render(&self, now: DateTime<Local>) -> String {
        let hour = now.hour();
        let (opening, close) = match hour {
            0..=3 => ("Up late", '?'),
            4..=11 => ("Good morning", '!'),
            12..=16 => ("Good afternoon", '!'),
            17..=21 => ("Good evening", '!'),
            _ => ("Time for bed", '!'),
        };
        match self.owners.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
            Some(owners) => format!("{opening}, {owners}{close}"),
            None => format!("{opening}{close}"),
        }
    }
}

impl ContentSource for GreetingSource {
    fn fetch(&self, now: DateTime<Local>) -> FetchFuture<'_> {
        Box::pin(future::ready(Ok(ContentValue::Text(self.render(now)))))
    }

    fn current(&self, now: DateTime<Local>) -> Option<ContentValue> {
        Some(ContentValue::Text(self.render(now)))
    }
}

/// Birthday greeting on matching days, empty otherwise.
#[derive(Debug, Clone, Default)]
pub struct BirthdaySource {
    /// "MM-DD" to name.
    pub people: BTreeMap<String, String>,
}

impl BirthdaySource {
    pub fn render(&self, now: DateTime<Local>) -> ContentValue {
        let key = format!("{:02}-{:02}", now.month(), now.day());
        match self.people.get(&key) {
            Some(name) => ContentValue::Text(format!("Happy birthday, {name}!")),
            None => ContentValue::Empty,
        }
    }
}

impl ContentSource for BirthdaySource {
    fn fetch(&self, now: DateTime<Local>) -> FetchFuture<'_> {
        Box::pin(future::ready(Ok(self.render(now))))
    }

    fn current(&self, now: DateTime<Local>) -> Option<ContentValue> {
        Some(self.render(now))
    }
}

/// Fixed text.
#[derive(Debug, Clone)]
pub struct StaticSource(pub ContentValue);

impl ContentSource for StaticSource {
    fn fetch(&self, _now: DateTime<Local>) -> FetchFuture<'_> {
        Box::pin(future::ready(Ok(self.0.clone())))
    }
}

/// How command output becomes content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Render {
    /// Whole trimmed stdout as one text.
    #[default]
    Text,
    /// One entry per non-blank line.
    Lines,
    /// First line is an image URL.
    Image,
}

impl Render {
    pub fn apply(self, stdout: &str) -> ContentValue {
        let text = stdout.trim();
        if text.is_empty() {
            return ContentValue::Empty;
        }
        match self {
            Render::Text => ContentValue::Text(text.to_string()),
            Render::Lines => ContentValue::Lines(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            Render::Image => {
                ContentValue::ImageUrl(text.lines().next().unwrap_or_default().trim().to_string())
            }
        }
    }
}

/// Runs an external program and renders its stdout.
///
/// The child is killed if the fetch is dropped (timeout or shutdown).
#[derive(Debug, Clone)]
pub struct CommandSource {
    pub program: String,
    pub args: Vec<String>,
    pub render: Render,
}

impl ContentSource for CommandSource {
    fn fetch(&self, _now: DateTime<Local>) -> FetchFuture<'_> {
        Box::pin(async move {
            let output = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() {
                return Err(FetchError::Command(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }
            if stdout.trim().is_empty() && !stderr.trim().is_empty() {
                return Err(FetchError::Command(format!(
                    "{} printed nothing: {}",
                    self.program,
                    stderr.trim()
                )));
            }
            Ok(self.render.apply(&stdout))
        })
    }
}

/// Source half of a widget definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceSpec {
    Day {
        #[serde(default)]
        style: DayStyle,
    },
    Greeting {
        #[serde(default)]
        owners: Option<String>,
    },
    Birthdays {
        people: BTreeMap<String, String>,
    },
    Static {
        text: String,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        render: Render,
    },
}

/// One `[[widget]]` table of the widgets file.
///
/// ```toml
/// [[widget]]
/// id = "stock"
/// source = "command"
/// program = "/usr/local/bin/quote"
/// args = ["GOOG"]
/// gate = { weekdays_after = 17 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WidgetSpec {
    pub id: WidgetId,
    #[serde(flatten)]
    pub source: SourceSpec,
    #[serde(default)]
    pub gate: FetchGate,
    /// Restrict visibility to these weekdays.
    #[serde(default)]
    pub visible_on: Option<Vec<Weekday>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WidgetsFile {
    #[serde(default, rename = "widget")]
    pub widgets: Vec<WidgetSpec>,
}

impl WidgetSpec {
    pub fn new(id: &str, source: SourceSpec) -> Self {
        Self {
            id: id.into(),
            source,
            gate: FetchGate::Always,
            visible_on: None,
        }
    }

    pub fn build(&self) -> (Arc<dyn ContentSource>, VisibilityRule) {
        let source: Arc<dyn ContentSource> = match &self.source {
            SourceSpec::Day { style } => Arc::new(DaySource { style: *style }),
            SourceSpec::Greeting { owners } => Arc::new(GreetingSource {
                owners: owners.clone(),
            }),
            SourceSpec::Birthdays { people } => Arc::new(BirthdaySource {
                people: people.clone(),
            }),
            SourceSpec::Static { text } => Arc::new(StaticSource(ContentValue::Text(text.clone()))),
            SourceSpec::Command {
                program,
                args,
                render,
            } => Arc::new(CommandSource {
                program: program.clone(),
                args: args.clone(),
                render: *render,
            }),
        };
        let rule = match &self.visible_on {
            Some(days) => VisibilityRule::ScheduledDays(days.clone()),
            None => VisibilityRule::Always,
        };
        (source, rule)
    }
}

/// Widgets shown when no widgets file is configured.
pub fn default_widgets() -> Vec<WidgetSpec> {
    vec![
        WidgetSpec::new("day", SourceSpec::Day { style: DayStyle::Us }),
        WidgetSpec::new("greeting", SourceSpec::Greeting { owners: None }),
        WidgetSpec::new(
            "presence",
            SourceSpec::Static {
                text: "I see you!".into(),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        FixedClock::at(y, m, d, h, 0).now()
    }

    #[test]
    fn test_day_us_style() {
        let day = DaySource { style: DayStyle::Us };
        assert_eq!(day.render(at(2026, 10, 16, 9)), "Friday the 16th");
        assert_eq!(day.render(at(2026, 10, 1, 9)), "Thursday the 1st");
        assert_eq!(day.render(at(2026, 10, 22, 9)), "Thursday the 22nd");
        assert_eq!(day.render(at(2026, 10, 23, 9)), "Friday the 23rd");
    }

    #[test]
    fn test_teens_take_th() {
        for d in 11..=13 {
            assert_eq!(ordinal_suffix(d), "th");
        }
        assert_eq!(ordinal_suffix(21), "st");
        assert_eq!(ordinal_suffix(31), "st");
    }

    #[test]
    fn test_day_international_style() {
        let day = DaySource {
            style: DayStyle::International,
        };
        assert_eq!(day.render(at(2026, 10, 16, 9)), "Friday, 16 October");
    }

    #[test]
    fn test_greeting_hours() {
        let g = GreetingSource {
            owners: Some("Sam & Alex".into()),
        };
        assert_eq!(g.render(at(2026, 10, 16, 3)), "Up late, Sam & Alex?");
        assert_eq!(g.render(at(2026, 10, 16, 4)), "Good morning, Sam & Alex!");
        assert_eq!(g.render(at(2026, 10, 16, 12)), "Good afternoon, Sam & Alex!");
        assert_eq!(g.render(at(2026, 10, 16, 17)), "Good evening, Sam & Alex!");
        assert_eq!(g.render(at(2026, 10, 16, 22)), "Time for bed, Sam & Alex!");
        assert_eq!(GreetingSource::default().render(at(2026, 10, 16, 8)), "Good morning!");
    }

    #[test]
    fn test_birthday_only_on_the_day() {
        let b = BirthdaySource {
            people: BTreeMap::from([("10-16".to_string(), "Robin".to_string())]),
        };
        assert_eq!(b.render(at(2026, 10, 16, 8)), ContentValue::from("Happy birthday, Robin!"));
        assert_eq!(b.render(at(2026, 10, 17, 8)), ContentValue::Empty);
    }

    #[test]
    fn test_only_clock_sources_render_locally() {
        let now = at(2026, 10, 16, 17);
        let greeting = WidgetSpec::new("greeting", SourceSpec::Greeting { owners: None }).build().0;
        assert_eq!(greeting.current(now), Some(ContentValue::from("Good evening!")));
        let day = WidgetSpec::new("day", SourceSpec::Day { style: DayStyle::Us }).build().0;
        assert_eq!(day.current(now), Some(ContentValue::from("Friday the 16th")));
        let fixed = WidgetSpec::new("presence", SourceSpec::Static { text: "I see you!".into() }).build().0;
        assert_eq!(fixed.current(now), None);
    }

    #[test]
    fn test_render_modes() {
        let out = "  first line\n\n second \n";
        assert_eq!(Render::Text.apply(out), ContentValue::from("first line\n\n second"));
        assert_eq!(
            Render::Lines.apply(out),
            ContentValue::Lines(vec!["first line".into(), "second".into()])
        );
        assert_eq!(
            Render::Image.apply("https://imgs.xkcd.com/comics/x.png\nalt"),
            ContentValue::ImageUrl("https://imgs.xkcd.com/comics/x.png".into())
        );
        assert_eq!(Render::Lines.apply(" \n "), ContentValue::Empty);
    }

    #[tokio::test]
    async fn test_command_source_stdout() {
        let cmd = CommandSource {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'Sunny, 72°'".into()],
            render: Render::Text,
        };
        let value = cmd.fetch(Local::now()).await.unwrap();
        assert_eq!(value, ContentValue::from("Sunny, 72°"));
    }

    #[tokio::test]
    async fn test_command_source_failure() {
        let cmd = CommandSource {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'no network' >&2; exit 3".into()],
            render: Render::Text,
        };
        let err = cmd.fetch(Local::now()).await.unwrap_err();
        assert!(matches!(err, FetchError::Command(ref m) if m.contains("no network")));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let cmd = CommandSource {
            program: "/nonexistent/mirror-widget".into(),
            args: vec![],
            render: Render::Text,
        };
        assert!(matches!(cmd.fetch(Local::now()).await, Err(FetchError::Io(_))));
    }

    #[test]
    fn test_widgets_file_parses() {
        let text = r#"
            [[widget]]
            id = "day"
            source = "day"
            style = "international"

            [[widget]]
            id = "stock"
            source = "command"
            program = "/usr/local/bin/quote"
            args = ["GOOG"]
            gate = { weekdays_after = 17 }

            [[widget]]
            id = "water_plants"
            source = "static"
            text = "Water the plants"
            visible_on = ["Sun", "Wed"]
        "#;
        let file: WidgetsFile = toml::from_str(text).unwrap();
        assert_eq!(file.widgets.len(), 3);

        assert_eq!(
            file.widgets[0].source,
            SourceSpec::Day {
                style: DayStyle::International
            }
        );
        assert_eq!(file.widgets[1].gate, FetchGate::WeekdaysAfter(17));
        assert_eq!(
            file.widgets[1].source,
            SourceSpec::Command {
                program: "/usr/local/bin/quote".into(),
                args: vec!["GOOG".into()],
                render: Render::Text,
            }
        );

        let (_, rule) = file.widgets[2].build();
        assert_eq!(rule, VisibilityRule::ScheduledDays(vec![Weekday::Sun, Weekday::Wed]));
    }

    #[tokio::test]
    async fn test_default_widgets() {
        let clock = FixedClock::at(2026, 10, 16, 9, 0);
        let widgets = default_widgets();
        let ids: Vec<&str> = widgets.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["day", "greeting", "presence"]);

        let (presence, rule) = widgets[2].build();
        assert_eq!(rule, VisibilityRule::Always);
        assert_eq!(
            presence.fetch(clock.now()).await.unwrap(),
            ContentValue::from("I see you!")
        );
    }
}
