//! Execution Timeline
//!
//! Start/end events per block instance, rebuilt from a run's logs so a
//! resumed run's chart spans every segment.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::execution::result::BlockLogEntry;

/// Width of the Gantt chart bars, in characters.
const CHART_WIDTH: f64 = 50.0;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Instance label, e.g. `agent[2]`
    pub block: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Ordered start/end events of block instances.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Creates an empty timeline starting now.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start_time: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            start_time,
        }
    }

    /// Builds a timeline from block log entries.
    pub fn from_logs(logs: &[BlockLogEntry]) -> Self {
        let start = logs
            .iter()
            .map(|l| l.started_at)
            .min()
            .unwrap_or_else(Utc::now);

        let mut timeline = Self::starting_at(start);
        for entry in logs {
            let label = entry.label();
            let end = if entry.success {
                EventType::Completed
            } else {
                EventType::Failed
            };
            timeline.add_event_at(label.clone(), EventType::Started, entry.started_at);
            timeline.add_event_at(label, end, entry.ended_at);
        }
        timeline
    }

    /// Records an event now.
    pub fn add_event(&mut self, block: String, event_type: EventType) {
        self.add_event_at(block, event_type, Utc::now());
    }

    pub fn add_event_at(&mut self, block: String, event_type: EventType, timestamp: DateTime<Utc>) {
        self.events.push(TimelineEvent {
            block,
            event_type,
            timestamp,
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Span from the timeline start to its latest event.
    pub fn span(&self) -> Duration {
        self.events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .map(|last| last - self.start_time)
            .unwrap_or_else(Duration::zero)
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - self.start_time).num_milliseconds().max(0)
    }

    /// (start, end) offsets in ms for each instance with both events.
    fn intervals(&self) -> Vec<(String, i64, i64)> {
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut intervals = Vec::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.block, offset);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(event.block.as_str()) {
                        intervals.push((event.block.clone(), start, offset));
                    }
                }
            }
        }

        intervals.sort_by_key(|(_, start, _)| *start);
        intervals
    }

    /// Renders an ASCII Gantt chart, one bar per instance.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.span().num_milliseconds();
        if total <= 0 {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        for (block, start, end) in self.intervals() {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64) * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{} |{:<50}| ({} ms)\n",
                truncate(&block, 14),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }

    /// Duration in ms of every instance that finished.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.intervals()
            .into_iter()
            .map(|(block, start, end)| (block, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or shortens a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
