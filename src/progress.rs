//! Ingestion progress reporting.
//!
//! The orchestrator reports every stage transition through a
//! [`ProgressReporter`]. The CLI writes these to **stderr** so stdout stays
//! parseable for scripts: one human-readable line per transition, or one
//! JSON object per line.

use std::io::{IsTerminal, Write};

use property_rag_core::models::{Stage, StageState};

/// One stage state change of one document.
#[derive(Clone, Debug)]
pub struct StageEvent {
    pub document_id: String,
    pub filename: String,
    pub stage: Stage,
    pub state: StageState,
}

pub trait ProgressReporter: Send + Sync {
    /// Called by the orchestrator after the transition is persisted.
    fn report(&self, event: &StageEvent);
}

/// `ingest lease.pdf  classification  succeeded`
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &StageEvent) {
        let line = format!(
            "ingest {}  {:<16}  {}\n",
            event.filename, event.stage, event.state
        );
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &StageEvent) {
        let obj = serde_json::json!({
            "event": "stage",
            "document_id": event.document_id,
            "filename": event.filename,
            "stage": event.stage,
            "state": event.state,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &StageEvent) {}
}

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
