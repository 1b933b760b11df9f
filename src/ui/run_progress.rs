//! Run progress rendering driven by the event bus.
//!
//! Output modes:
//! - `full`: progress bars per running unit plus an overall bar
//! - `minimal`: one line per finished unit
//! - `json`: every event as a JSON line on stdout

use crate::dag::{PlanGraph, UnitRef};
use crate::engine::{RunReport, RunStatus};
use crate::events::{Event, EventStream};
use crate::state::{TransitionEvent, UnitState};
use crate::ui::icons::{CHECK, CROSS, PAUSE, PHASE, RETRY, RUNNING, SAVE, SKIP, SPARKLE};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// One line per finished unit
    Minimal,
    /// JSON-formatted events
    Json,
}

/// Renders the events of one run.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    unit_bars: HashMap<String, ProgressBar>,
    /// Tasks and leaf phases; other phases only group their tasks
    executable: HashSet<String>,
    term: Term,
}

fn style_or_default(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl RunUI {
    /// `already_done` covers units that finished before a resume.
    pub fn new(graph: &PlanGraph, already_done: usize, mode: UiMode) -> Self {
        let multi = match mode {
            UiMode::Full => MultiProgress::new(),
            _ => MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        };

        let executable = graph
            .schedule()
            .iter()
            .filter(|id| match graph.locate(id) {
                Some(UnitRef::Phase(p)) => graph.is_leaf_phase(p),
                Some(UnitRef::Task { .. }) => true,
                None => false,
            })
            .map(|id| id.to_string())
            .collect();

        let header_bar = multi.add(ProgressBar::new(graph.unit_count() as u64));
        header_bar.set_style(
            style_or_default("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .progress_chars("█▓▒░"),
        );
        header_bar.set_prefix("Run");
        header_bar.set_position(already_done as u64);
        header_bar.set_message("Starting...");

        Self {
            mode,
            multi,
            header_bar,
            unit_bars: HashMap::new(),
            executable,
            term: Term::stdout(),
        }
    }

    /// Consume events until the run's bus closes.
    pub async fn drive(mut self, mut events: EventStream) {
        while let Some(event) = events.next().await {
            self.handle_event(&event);
        }
        self.header_bar.finish_and_clear();
    }

    pub fn handle_event(&mut self, event: &Event) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &Event) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &Event) {
        let unit = &event.unit_id;
        match event.to {
            UnitState::Completed => {
                let _ = writeln!(&self.term, "{}{}", CHECK, unit);
            }
            UnitState::Aborted => {
                let _ = writeln!(&self.term, "{}{} aborted", CROSS, unit);
            }
            UnitState::Skipped => {
                let _ = writeln!(&self.term, "{}{} skipped", SKIP, unit);
            }
            UnitState::Retrying => {
                let _ = writeln!(&self.term, "{}{} retrying", RETRY, unit);
            }
            _ => {}
        }
    }

    fn handle_full(&mut self, event: &Event) {
        let unit = event.unit_id.as_str();

        match (event.event, event.to) {
            (TransitionEvent::Dispatch, _) if !self.executable.contains(unit) => {
                self.multi
                    .println(format!("{}Phase {} active", PHASE, style(unit).yellow().bold()))
                    .ok();
            }
            (TransitionEvent::Dispatch, _) => self.on_unit_started(unit),
            (TransitionEvent::Fail, _) => {
                if let Some(bar) = self.unit_bars.get(unit) {
                    bar.set_message(format!("{}failed", CROSS));
                }
            }
            (TransitionEvent::Retry, _) => {
                let delay = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("delay_ms"))
                    .and_then(|d| d.as_u64())
                    .unwrap_or(0);
                if let Some(bar) = self.unit_bars.remove(unit) {
                    bar.finish_and_clear();
                }
                self.multi
                    .println(format!(
                        "  {}{} retrying in {}",
                        RETRY,
                        style(unit).yellow(),
                        format_duration(Duration::from_millis(delay))
                    ))
                    .ok();
            }
            (TransitionEvent::Interrupt, _) => {
                if let Some(bar) = self.unit_bars.remove(unit) {
                    bar.abandon_with_message(format!("{}interrupted", PAUSE));
                }
            }
            (_, UnitState::Completed) => self.on_unit_finished(unit, true, "complete"),
            (_, UnitState::Aborted) => self.on_unit_finished(unit, false, "aborted"),
            (_, UnitState::Skipped) => self.on_unit_skipped(unit, event),
            _ => {}
        }
    }

    fn on_unit_started(&mut self, unit: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style_or_default("  {spinner:.green} {prefix:.bold} {msg} {elapsed}"));
        bar.set_prefix(format!("[{}]", unit));
        bar.set_message(format!("{}running", RUNNING));
        bar.enable_steady_tick(Duration::from_millis(100));
        self.unit_bars.insert(unit.to_string(), bar);
        self.header_bar.set_message(format!("{} running", self.unit_bars.len()));
    }

    fn on_unit_finished(&mut self, unit: &str, success: bool, label: &str) {
        if let Some(bar) = self.unit_bars.remove(unit) {
            bar.finish_and_clear();
        }
        self.header_bar.inc(1);

        let line = if success {
            format!("  {}{} {}", SPARKLE, style(unit).green().bold(), style(label).green())
        } else {
            format!("  {}{} {}", CROSS, style(unit).red().bold(), style(label).red())
        };
        self.multi.println(line).ok();
    }

    fn on_unit_skipped(&mut self, unit: &str, event: &Event) {
        if let Some(bar) = self.unit_bars.remove(unit) {
            bar.finish_and_clear();
        }
        self.header_bar.inc(1);

        let cause = event
            .payload
            .as_ref()
            .and_then(|p| p.get("cause"))
            .and_then(|c| c.as_str())
            .map(|c| format!(" (after {c})"))
            .unwrap_or_default();
        self.multi
            .println(format!("  {}{} skipped{}", SKIP, style(unit).dim(), cause))
            .ok();
    }
}

/// Print the closing summary of a run.
pub fn print_report(report: &RunReport) {
    let status = match report.status {
        RunStatus::Completed => style(report.status.to_string()).green().bold(),
        RunStatus::CompletedWithSkips => style(report.status.to_string()).yellow().bold(),
        RunStatus::Failed | RunStatus::Cancelled => style(report.status.to_string()).red().bold(),
    };

    println!();
    println!("Run {} {}", report.run_id, status);
    println!(
        "  Units: {} completed, {} skipped, {} aborted, {} pending ({} total)",
        report.counts.completed,
        report.counts.skipped,
        report.counts.aborted,
        report.counts.pending + report.counts.ready + report.counts.retrying,
        report.counts.total()
    );
    println!(
        "  Retries: {}  Duration: {}",
        report.recovery.retries,
        format_duration(report.duration)
    );

    for record in report.aborted() {
        let message = record
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        println!("  {}{}: {}", CROSS, style(&record.id).red(), message);
    }

    if let Some(ref checkpoint) = report.checkpoint {
        println!("  {}Checkpoint: {}", SAVE, checkpoint);
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{}s", secs, d.subsec_millis() / 100)
    } else {
        format!("{}ms", d.as_millis())
    }
}
