use crate::config::AlertTarget;
use crate::connection::{ConnectionRecord, ConnectionState, Fingerprint, SocketLabel};
use crate::diff::Classification;
use crate::error::{AlertError, PersistenceError};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// State change of a known connection, with enough context to read alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionAlert {
    pub fingerprint: Fingerprint,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub pid: u32,
    pub process_name: String,
}

/// Known connection dropped from the baseline after its grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VanishedConnection {
    pub fingerprint: Fingerprint,
    pub last_state: ConnectionState,
    pub pid: u32,
    pub process_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Everything one completed cycle found.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub captured_at: DateTime<Utc>,
    pub classification: Classification,
    /// Full records for every fingerprint in `classification.new`
    pub new_connections: Vec<ConnectionRecord>,
    pub transitions: Vec<TransitionAlert>,
    pub vanished: Vec<VanishedConnection>,
}

impl CycleReport {
    pub fn has_events(&self) -> bool {
        !self.new_connections.is_empty() || !self.transitions.is_empty() || !self.vanished.is_empty()
    }
}

/// Operator-facing output for cycle results.
pub trait AlertSink: Send {
    fn emit(&mut self, report: &CycleReport) -> Result<(), AlertError>;

    /// Baseline writes have failed more often in a row than allowed.
    fn durability_degraded(&mut self, consecutive_failures: u32, error: &PersistenceError);
}

pub fn build_sink(target: &AlertTarget) -> Box<dyn AlertSink> {
    match target {
        AlertTarget::Console => Box::new(LogSink),
        AlertTarget::JsonFile(path) => {
            info!("New connections will also be written to {}", path.display());
            Box::new(FanoutSink(vec![
                Box::new(LogSink),
                Box::new(JsonLinesSink::new(path.clone())),
            ]))
        }
    }
}

/// Writes alerts through the log facade: new connections at warn, state
/// changes and evictions at info.
pub struct LogSink;

impl AlertSink for LogSink {
    fn emit(&mut self, report: &CycleReport) -> Result<(), AlertError> {
        for record in &report.new_connections {
            warn!(
                "New connection detected: {} (PID: {}) {} -> {} {} [{}]",
                record.process_label(),
                record.pid,
                SocketLabel(record.local_addr, record.local_port),
                SocketLabel(record.remote_addr, record.remote_port),
                record.protocol,
                record.state
            );
        }
        for t in &report.transitions {
            info!(
                "State change: {} {} -> {} ({}, PID: {})",
                t.fingerprint,
                t.from,
                t.to,
                if t.process_name.is_empty() { "unknown" } else { &t.process_name },
                t.pid
            );
        }
        for v in &report.vanished {
            info!(
                "Connection gone: {} last {} (first seen {}, last seen {})",
                v.fingerprint,
                v.last_state,
                v.first_seen.format("%Y-%m-%d %H:%M:%S"),
                v.last_seen.format("%Y-%m-%d %H:%M:%S")
            );
        }
        if !report.has_events() {
            debug!(
                "Cycle {}: nothing new ({} known live)",
                report.cycle,
                report.classification.unchanged.len()
            );
        }
        Ok(())
    }

    fn durability_degraded(&mut self, consecutive_failures: u32, err: &PersistenceError) {
        error!(
            "Baseline has not been saved for {} consecutive cycles ({}); a restart now would lose tracking state",
            consecutive_failures, err
        );
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum AlertEvent<'a> {
    NewConnection {
        cycle: u64,
        #[serde(flatten)]
        record: &'a ConnectionRecord,
    },
    StateTransition {
        cycle: u64,
        at: DateTime<Utc>,
        #[serde(flatten)]
        transition: &'a TransitionAlert,
    },
    Vanished {
        cycle: u64,
        at: DateTime<Utc>,
        #[serde(flatten)]
        connection: &'a VanishedConnection,
    },
    DurabilityDegraded {
        at: DateTime<Utc>,
        consecutive_failures: u32,
        error: String,
    },
}

/// Appends one JSON object per event to a file.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: PathBuf) -> Self {
        JsonLinesSink { path }
    }

    fn append(&self, events: &[AlertEvent<'_>]) -> Result<(), AlertError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let io_err = |source| AlertError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(&buf).map_err(io_err)?;
        Ok(())
    }
}

impl AlertSink for JsonLinesSink {
    fn emit(&mut self, report: &CycleReport) -> Result<(), AlertError> {
        let cycle = report.cycle;
        let at = report.captured_at;
        let events: Vec<AlertEvent<'_>> = report
            .new_connections
            .iter()
            .map(|record| AlertEvent::NewConnection { cycle, record })
            .chain(report.transitions.iter().map(|transition| AlertEvent::StateTransition {
                cycle,
                at,
                transition,
            }))
            .chain(report.vanished.iter().map(|connection| AlertEvent::Vanished {
                cycle,
                at,
                connection,
            }))
            .collect();

        self.append(&events)?;
        if !events.is_empty() {
            debug!("Wrote {} alert events to {}", events.len(), self.path.display());
        }
        Ok(())
    }

    fn durability_degraded(&mut self, consecutive_failures: u32, err: &PersistenceError) {
        let event = AlertEvent::DurabilityDegraded {
            at: Utc::now(),
            consecutive_failures,
            error: err.to_string(),
        };
        if let Err(e) = self.append(&[event]) {
            error!("Could not record durability alert: {}", e);
        }
    }
}

/// Hands every report to each inner sink; the first error is returned after
/// all sinks have run.
pub struct FanoutSink(pub Vec<Box<dyn AlertSink>>);

impl AlertSink for FanoutSink {
    fn emit(&mut self, report: &CycleReport) -> Result<(), AlertError> {
        let mut first_err = None;
        for sink in self.0.iter_mut() {
            if let Err(e) = sink.emit(report) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn durability_degraded(&mut self, consecutive_failures: u32, err: &PersistenceError) {
        for sink in self.0.iter_mut() {
            sink.durability_degraded(consecutive_failures, err);
        }
    }
}
