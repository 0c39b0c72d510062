//! Batch progress reporting for `traq backfill` and `traq embed regenerate`.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::{IsTerminal, Write};

use traq_attribution_core::models::EventType;

/// A single progress event for a batch job.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchProgressEvent {
    /// Loading the candidate events of one type. Total unknown.
    Scanning { job: &'static str, event_type: EventType },
    /// `n` of `total` candidates handled.
    Processing {
        job: &'static str,
        event_type: Option<EventType>,
        n: u64,
        total: u64,
    },
}

/// Receives progress from batch runners.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly lines: "backfill focus  processing  1,200 / 5,000 events".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Scanning { job, event_type } => {
                format!("{} {}  scanning...\n", job, event_type)
            }
            BatchProgressEvent::Processing {
                job,
                event_type,
                n,
                total,
            } => {
                let label = event_type.map(|t| format!(" {}", t)).unwrap_or_default();
                format!(
                    "{}{}  processing  {} / {} events\n",
                    job,
                    label,
                    format_number(*n),
                    format_number(*total)
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = match &event {
            BatchProgressEvent::Scanning { job, event_type } => serde_json::json!({
                "event": "progress",
                "job": job,
                "event_type": event_type,
                "phase": "scanning"
            }),
            BatchProgressEvent::Processing {
                job,
                event_type,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "job": job,
                "event_type": event_type,
                "phase": "processing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
