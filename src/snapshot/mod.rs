//! Point-in-time view of the OS connection table.
//!
//! Each platform has one [`SnapshotSource`]; everything above this module
//! works on [`Snapshot`] and never branches on platform.

#[cfg(target_os = "linux")]
pub mod proc_net;
#[cfg(windows)]
pub mod iphelper;

use crate::connection::{ConnectionRecord, Fingerprint};
use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Enumerates the live sockets of the host.
///
/// Blocking; the poll loop runs it off the async workers. Records whose owner
/// cannot be read are returned with pid 0 and an empty name rather than
/// dropped.
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>, SnapshotError>;
}

/// A successful enumeration keyed by fingerprint.
///
/// There is no way to build one from a failed enumeration, so an empty
/// snapshot always means the table really was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    captured_at: DateTime<Utc>,
    records: BTreeMap<Fingerprint, ConnectionRecord>,
}

impl Snapshot {
    pub fn from_records(records: Vec<ConnectionRecord>, captured_at: DateTime<Utc>) -> Self {
        let mut by_fingerprint = BTreeMap::new();
        for record in records {
            let fingerprint = record.fingerprint();
            if by_fingerprint.contains_key(&fingerprint) {
                debug!("Duplicate socket {} in snapshot, keeping first", fingerprint);
                continue;
            }
            by_fingerprint.insert(fingerprint, record);
        }
        Snapshot {
            captured_at,
            records: by_fingerprint,
        }
    }

    #[cfg(test)]
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self::from_records(Vec::new(), captured_at)
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&ConnectionRecord> {
        self.records.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.records.contains_key(fingerprint)
    }

    pub fn fingerprints(&self) -> BTreeSet<Fingerprint> {
        self.records.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &ConnectionRecord)> {
        self.records.iter()
    }
}

type Enumeration = JoinHandle<Result<Vec<ConnectionRecord>, SnapshotError>>;

/// Runs enumerations on the blocking pool, bounded by a timeout, one at a
/// time.
///
/// A timed-out enumeration cannot be cancelled. Its task is kept, and every
/// capture attempted while it is still running fails with
/// [`SnapshotError::StillRunning`] instead of starting a second one. Once it
/// finishes its stale result is dropped and the next capture starts fresh.
pub struct Capturer {
    source: Arc<dyn SnapshotSource>,
    timeout: Duration,
    stalled: Option<Enumeration>,
}

impl Capturer {
    pub fn new(source: Arc<dyn SnapshotSource>, timeout: Duration) -> Self {
        Capturer {
            source,
            timeout,
            stalled: None,
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub async fn capture(&mut self) -> Result<Vec<ConnectionRecord>, SnapshotError> {
        if let Some(stalled) = self.stalled.take() {
            if !stalled.is_finished() {
                self.stalled = Some(stalled);
                return Err(SnapshotError::StillRunning(self.timeout));
            }
            debug!("Timed-out enumeration finished, discarding its result");
        }

        let source = self.source.clone();
        let mut task = tokio::task::spawn_blocking(move || source.snapshot());
        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SnapshotError::Join(join_err.to_string())),
            Err(_) => {
                self.stalled = Some(task);
                Err(SnapshotError::Timeout(self.timeout))
            }
        }
    }
}

/// The source for the platform this binary was built for.
#[cfg(target_os = "linux")]
pub fn platform_source() -> Result<Arc<dyn SnapshotSource>, SnapshotError> {
    Ok(Arc::new(proc_net::ProcNetSource::new()))
}

#[cfg(windows)]
pub fn platform_source() -> Result<Arc<dyn SnapshotSource>, SnapshotError> {
    Ok(Arc::new(iphelper::TcpTableSource::new()))
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn platform_source() -> Result<Arc<dyn SnapshotSource>, SnapshotError> {
    Err(SnapshotError::Unsupported)
}
