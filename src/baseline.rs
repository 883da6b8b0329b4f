//! Durable record of every connection seen so far.
//!
//! The store itself is plain in-memory state; bytes only move through a
//! [`BaselineMedium`] inside [`BaselineStore::load`] and [`BaselineStore::save`].

use crate::connection::{ConnectionRecord, ConnectionState, Fingerprint, Protocol};
use crate::error::{BaselineError, PersistenceError};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

const FORMAT_VERSION: u32 = 1;

/// Byte-level storage for the serialized baseline.
pub trait BaselineMedium: Send {
    /// Human-readable location used in logs and errors
    fn location(&self) -> String;

    /// `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> std::io::Result<Option<Vec<u8>>>;

    /// Replaces the stored bytes. A crash mid-write must leave either the old
    /// or the new content, never a truncated mix.
    fn write(&self, bytes: &[u8]) -> std::io::Result<()>;

    /// Moves unreadable content aside so the next write does not destroy it.
    fn preserve_corrupt(&self) -> std::io::Result<Option<String>> {
        Ok(None)
    }
}

/// Baseline kept in a JSON file, replaced with write-to-temp + rename.
#[derive(Debug, Clone)]
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMedium { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        self.path
            .with_extension(format!("tmp-{}", std::process::id()))
    }
}

impl BaselineMedium for FileMedium {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> std::io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.temp_path();
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }

    fn preserve_corrupt(&self) -> std::io::Result<Option<String>> {
        let target = self.path.with_extension("corrupt");
        fs::rename(&self.path, &target)?;
        Ok(Some(target.display().to_string()))
    }
}

/// What to do when the persisted baseline cannot be parsed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptBaselinePolicy {
    /// Warn and start tracking from an empty baseline
    #[default]
    StartEmpty,
    /// Refuse to start
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineEntry {
    /// Most recent observation, addresses canonicalized
    pub record: ConnectionRecord,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Consecutive polls this fingerprint has been absent
    pub missed_polls: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineStore {
    entries: BTreeMap<Fingerprint, BaselineEntry>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted baseline. Nothing stored yet is a first run and
    /// yields an empty store.
    pub fn load(medium: &dyn BaselineMedium) -> Result<Self, BaselineError> {
        let bytes = match medium.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No baseline at {}, starting empty", medium.location());
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(BaselineError::Io {
                    location: medium.location(),
                    source,
                })
            }
        };

        let file: PersistedBaseline =
            serde_json::from_slice(&bytes).map_err(|err| BaselineError::Corrupt {
                location: medium.location(),
                reason: err.to_string(),
            })?;

        if file.version > FORMAT_VERSION {
            warn!(
                "Baseline {} has format version {} (newer than {}), reading known fields only",
                medium.location(),
                file.version,
                FORMAT_VERSION
            );
        }

        let mut store = Self::new();
        for persisted in file.connections {
            let (fingerprint, entry) = persisted.into_entry();
            match store.entries.get(&fingerprint) {
                Some(existing) if existing.last_seen >= entry.last_seen => {
                    warn!("Duplicate baseline entry for {} ignored", fingerprint);
                }
                Some(_) => {
                    warn!("Duplicate baseline entry for {} replaced by newer one", fingerprint);
                    store.entries.insert(fingerprint, entry);
                }
                None => {
                    store.entries.insert(fingerprint, entry);
                }
            }
        }

        debug!(
            "Loaded {} known connections from {}",
            store.len(),
            medium.location()
        );
        Ok(store)
    }

    /// [`BaselineStore::load`] with the corrupt-file policy applied.
    pub fn load_or_recover(
        medium: &dyn BaselineMedium,
        policy: CorruptBaselinePolicy,
    ) -> Result<Self, BaselineError> {
        match Self::load(medium) {
            Err(err @ BaselineError::Corrupt { .. }) => match policy {
                CorruptBaselinePolicy::Abort => Err(err),
                CorruptBaselinePolicy::StartEmpty => {
                    warn!("{}; starting with an empty baseline", err);
                    match medium.preserve_corrupt() {
                        Ok(Some(moved_to)) => warn!("Corrupt baseline moved to {}", moved_to),
                        Ok(None) => {}
                        Err(e) => warn!("Could not move corrupt baseline aside: {}", e),
                    }
                    Ok(Self::new())
                }
            },
            other => other,
        }
    }

    pub fn save(&self, medium: &dyn BaselineMedium) -> Result<(), PersistenceError> {
        let file = PersistedBaseline {
            version: FORMAT_VERSION,
            connections: self
                .entries
                .iter()
                .map(|(fingerprint, entry)| PersistedEntry::from_entry(fingerprint, entry))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        medium.write(&bytes).map_err(|source| PersistenceError::Io {
            location: medium.location(),
            source,
        })
    }

    /// Records a sighting. `first_seen` is set only on first insert.
    pub fn upsert(&mut self, fingerprint: Fingerprint, record: &ConnectionRecord, now: DateTime<Utc>) {
        let mut record = record.clone();
        record.local_addr = fingerprint.local_addr;
        record.remote_addr = fingerprint.remote_addr;

        match self.entries.get_mut(&fingerprint) {
            Some(entry) => {
                entry.record = record;
                entry.last_seen = now;
                entry.missed_polls = 0;
            }
            None => {
                self.entries.insert(
                    fingerprint,
                    BaselineEntry {
                        record,
                        first_seen: now,
                        last_seen: now,
                        missed_polls: 0,
                    },
                );
            }
        }
    }

    /// Ages every entry absent from `current` by one poll and removes those
    /// that have now been missing for `grace_polls` consecutive polls.
    pub fn evict_stale(
        &mut self,
        current: &BTreeSet<Fingerprint>,
        grace_polls: u32,
    ) -> Vec<(Fingerprint, BaselineEntry)> {
        let grace_polls = grace_polls.max(1);
        let mut expired = Vec::new();

        for (fingerprint, entry) in self.entries.iter_mut() {
            if current.contains(fingerprint) {
                entry.missed_polls = 0;
                continue;
            }
            entry.missed_polls = entry.missed_polls.saturating_add(1);
            if entry.missed_polls >= grace_polls {
                expired.push(*fingerprint);
            }
        }

        expired
            .into_iter()
            .filter_map(|fingerprint| {
                self.entries
                    .remove(&fingerprint)
                    .map(|entry| (fingerprint, entry))
            })
            .collect()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&BaselineEntry> {
        self.entries.get(fingerprint)
    }

    #[cfg(test)]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &BaselineEntry)> {
        self.entries.iter()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedBaseline {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    connections: Vec<PersistedEntry>,
}

fn default_version() -> u32 {
    FORMAT_VERSION
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    protocol: Protocol,
    local_addr: IpAddr,
    local_port: u16,
    remote_addr: IpAddr,
    remote_port: u16,
    #[serde(default = "unknown_state")]
    state: ConnectionState,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    process_name: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    missed_polls: u32,
}

fn unknown_state() -> ConnectionState {
    ConnectionState::Unknown
}

impl PersistedEntry {
    fn from_entry(fingerprint: &Fingerprint, entry: &BaselineEntry) -> Self {
        PersistedEntry {
            protocol: fingerprint.protocol,
            local_addr: fingerprint.local_addr,
            local_port: fingerprint.local_port,
            remote_addr: fingerprint.remote_addr,
            remote_port: fingerprint.remote_port,
            state: entry.record.state,
            pid: entry.record.pid,
            process_name: entry.record.process_name.clone(),
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            observed_at: (entry.record.observed_at != entry.last_seen)
                .then_some(entry.record.observed_at),
            missed_polls: entry.missed_polls,
        }
    }

    fn into_entry(self) -> (Fingerprint, BaselineEntry) {
        let fingerprint = Fingerprint::new(
            self.protocol,
            self.local_addr,
            self.local_port,
            self.remote_addr,
            self.remote_port,
        );
        let record = ConnectionRecord {
            pid: self.pid,
            process_name: self.process_name,
            local_addr: fingerprint.local_addr,
            local_port: fingerprint.local_port,
            remote_addr: fingerprint.remote_addr,
            remote_port: fingerprint.remote_port,
            state: self.state,
            protocol: fingerprint.protocol,
            observed_at: self.observed_at.unwrap_or(self.last_seen),
        };
        (
            fingerprint,
            BaselineEntry {
                record,
                first_seen: self.first_seen,
                last_seen: self.last_seen,
                missed_polls: self.missed_polls,
            },
        )
    }
}
