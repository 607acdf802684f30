//! Per-job status channel.
//!
//! An append-only event log consumed by subscribers (UI, automation, tests)
//! through a cursor: `since(n)` returns everything appended at or after
//! index `n`, in append order. Events are never mutated or removed; the
//! whole log is discarded only when its job is reclaimed. A job finishes
//! with exactly one terminal outcome, and the event describing it is always
//! the last event appended.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A stage-transition or human-oriented progress message.
    Status,
    /// A raw output line streamed from an external tool.
    Log,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub text: String,
    pub kind: EventKind,
    pub at_unix: u64,
}

/// Terminal payload for a finished job: a retrieval handle on success, a
/// human-readable message on failure. Never both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success { bundle: PathBuf },
    Failure { message: String },
}

#[derive(Debug, Default)]
struct LogInner {
    events: Vec<StatusEvent>,
    outcome: Option<Outcome>,
}

#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<LogInner>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, text: impl Into<String>) {
        self.append(text.into(), EventKind::Status);
    }

    pub fn log(&self, text: impl Into<String>) {
        self.append(text.into(), EventKind::Log);
    }

    fn append(&self, text: String, kind: EventKind) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        // Nothing may be appended after the terminal event.
        if inner.outcome.is_some() {
            return;
        }
        inner.events.push(StatusEvent {
            text,
            kind,
            at_unix: now_unix(),
        });
    }

    /// Record the terminal outcome and its trailing event. The first call
    /// wins; later calls are ignored so a job can never end twice.
    pub fn finish(&self, outcome: Outcome) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        if inner.outcome.is_some() {
            return;
        }
        let text = match &outcome {
            Outcome::Success { bundle } => {
                format!("Bundle ready: {}", bundle.display())
            }
            Outcome::Failure { message } => message.clone(),
        };
        inner.events.push(StatusEvent {
            text,
            kind: EventKind::Status,
            at_unix: now_unix(),
        });
        inner.outcome = Some(outcome);
    }

    /// Everything appended at or after `index`, plus the terminal outcome
    /// once one exists.
    pub fn since(&self, index: usize) -> (Vec<StatusEvent>, Option<Outcome>) {
        let inner = self.inner.lock().expect("event log poisoned");
        let events = if index >= inner.events.len() {
            Vec::new()
        } else {
            inner.events[index..].to_vec()
        };
        (events, inner.outcome.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event log poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().expect("event log poisoned").outcome.clone()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
