//! Fakes shared by unit tests across modules.

use crate::alert::{AlertSink, CycleReport};
use crate::baseline::BaselineMedium;
use crate::connection::{ConnectionRecord, ConnectionState, Protocol};
use crate::error::{AlertError, PersistenceError, SnapshotError};
use crate::snapshot::SnapshotSource;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
}

pub fn tcp(local: &str, local_port: u16, remote: &str, remote_port: u16) -> ConnectionRecord {
    ConnectionRecord {
        pid: 100,
        process_name: "curl".to_string(),
        local_addr: local.parse().expect("local addr"),
        local_port,
        remote_addr: remote.parse().expect("remote addr"),
        remote_port,
        state: ConnectionState::Established,
        protocol: Protocol::TCP,
        observed_at: at(0),
    }
}

/// The connection used throughout the scenarios: 10.0.0.1:5000 -> 93.1.1.1:443
pub fn scenario_record() -> ConnectionRecord {
    tcp("10.0.0.1", 5000, "93.1.1.1", 443)
}

/// In-memory medium with switchable write failures.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
    fail_writes: Arc<Mutex<bool>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryMedium {
    pub fn with_bytes(bytes: &[u8]) -> Self {
        let medium = Self::default();
        *medium.bytes.lock().unwrap() = Some(bytes.to_vec());
        medium
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

impl BaselineMedium for MemoryMedium {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().unwrap().clone())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        *self.writes.lock().unwrap() += 1;
        if *self.fail_writes.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        *self.bytes.lock().unwrap() = Some(bytes.to_vec());
        Ok(())
    }
}

/// Replays a fixed sequence of snapshot results, then keeps returning the
/// last one.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<ConnectionRecord>, SnapshotError>>>,
    last: Mutex<Vec<ConnectionRecord>>,
    calls: Mutex<usize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<ConnectionRecord>, SnapshotError>>) -> Arc<Self> {
        Arc::new(ScriptedSource {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SnapshotSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>, SnapshotError> {
        *self.calls.lock().unwrap() += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(records)) => {
                *self.last.lock().unwrap() = records.clone();
                Ok(records)
            }
            Some(Err(err)) => Err(err),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

#[derive(Default)]
pub struct Recorded {
    pub reports: Vec<CycleReport>,
    pub degraded: Vec<u32>,
}

/// Sink that keeps everything it is handed.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub recorded: Arc<Mutex<Recorded>>,
}

impl AlertSink for RecordingSink {
    fn emit(&mut self, report: &CycleReport) -> Result<(), AlertError> {
        self.recorded.lock().unwrap().reports.push(report.clone());
        Ok(())
    }

    fn durability_degraded(&mut self, consecutive_failures: u32, _error: &PersistenceError) {
        self.recorded
            .lock()
            .unwrap()
            .degraded
            .push(consecutive_failures);
    }
}
