//! The poll loop.
//!
//! One task owns the baseline and walks every cycle through
//! `Idle -> Snapshotting -> Diffing -> Alerting -> Persisting -> Idle`.
//! A stop request is honoured before a snapshot starts, right after one
//! finishes (the snapshot is then discarded) and while sleeping. Once diffing
//! has touched the baseline the cycle always runs through persisting, so
//! nothing folded into the baseline goes unalerted.

use crate::alert::{AlertSink, CycleReport, TransitionAlert, VanishedConnection};
use crate::baseline::{BaselineMedium, BaselineStore};
use crate::config::MonitorConfig;
use crate::diff::diff;
use crate::filter::ConnectionFilter;
use crate::snapshot::{Capturer, Snapshot, SnapshotSource};
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Wall-clock source for baseline timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Snapshotting,
    Diffing,
    Alerting,
    Persisting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub snapshot_timeout: Duration,
    pub grace_polls: u32,
    pub persist_failure_threshold: u32,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        MonitorSettings {
            interval: config.interval(),
            snapshot_timeout: config.snapshot_timeout(),
            grace_polls: config.grace_polls,
            persist_failure_threshold: config.persist_failure_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub save_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        new: usize,
        transitions: usize,
        vanished: usize,
    },
    /// Enumeration failed or timed out; the baseline was not touched
    SnapshotFailed,
    Stopped,
}

pub struct Monitor {
    settings: MonitorSettings,
    capturer: Capturer,
    filter: ConnectionFilter,
    medium: Box<dyn BaselineMedium>,
    baseline: BaselineStore,
    sink: Box<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    phase: Phase,
    cycle: u64,
    unsaved: bool,
    consecutive_save_failures: u32,
    stats: RunStats,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        source: Arc<dyn SnapshotSource>,
        filter: ConnectionFilter,
        medium: Box<dyn BaselineMedium>,
        baseline: BaselineStore,
        sink: Box<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Monitor {
            capturer: Capturer::new(source, settings.snapshot_timeout),
            settings,
            filter,
            medium,
            baseline,
            sink,
            clock,
            phase: Phase::Idle,
            cycle: 0,
            unsaved: false,
            consecutive_save_failures: 0,
            stats: RunStats::default(),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn baseline(&self) -> &BaselineStore {
        &self.baseline
    }

    #[cfg(test)]
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Polls until `stop` turns true. The first cycle starts immediately;
    /// later ones start a fixed interval after the previous start. Ticks
    /// missed by a slow cycle are dropped rather than replayed.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> RunStats {
        info!(
            "Monitoring {} via {} every {:?} ({} known connections)",
            self.medium.location(),
            self.capturer.source_name(),
            self.settings.interval,
            self.baseline.len()
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            if self.run_cycle(&stop).await == CycleOutcome::Stopped {
                break;
            }
            let took = started.elapsed();
            if took > self.settings.interval {
                warn!(
                    "Cycle {} took {:?}, longer than the {:?} interval; missed ticks are skipped",
                    self.cycle, took, self.settings.interval
                );
            }
        }

        self.shutdown();
        self.stats
    }

    /// Runs a single cycle regardless of the schedule, then flushes.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let (_keep, stop) = watch::channel(false);
        let outcome = self.run_cycle(&stop).await;
        self.shutdown();
        outcome
    }

    pub async fn run_cycle(&mut self, stop: &watch::Receiver<bool>) -> CycleOutcome {
        if *stop.borrow() {
            return CycleOutcome::Stopped;
        }
        self.cycle += 1;
        let cycle = self.cycle;

        self.enter(Phase::Snapshotting);
        let records = match self.capturer.capture().await {
            Ok(records) => records,
            Err(e) => {
                error!("Cycle {} phase snapshotting: {}; skipping this cycle", cycle, e);
                self.stats.cycles_skipped += 1;
                self.enter(Phase::Idle);
                return CycleOutcome::SnapshotFailed;
            }
        };
        let snapshot = Snapshot::from_records(self.filter.apply(records), self.clock.now());
        if snapshot.is_empty() {
            debug!("Cycle {}: connection table is empty, every known entry ages by one poll", cycle);
        } else {
            debug!("Cycle {}: {} tracked sockets", cycle, snapshot.len());
        }

        if *stop.borrow() {
            debug!("Stop requested after snapshot of cycle {}, discarding it", cycle);
            self.enter(Phase::Idle);
            return CycleOutcome::Stopped;
        }

        self.enter(Phase::Diffing);
        let report = self.fold(cycle, &snapshot);

        self.enter(Phase::Alerting);
        if let Err(e) = self.sink.emit(&report) {
            error!("Cycle {} phase alerting: {}", cycle, e);
        }

        self.enter(Phase::Persisting);
        self.persist();

        self.enter(Phase::Idle);
        self.stats.cycles_completed += 1;
        CycleOutcome::Completed {
            new: report.new_connections.len(),
            transitions: report.transitions.len(),
            vanished: report.vanished.len(),
        }
    }

    /// Classifies the snapshot and folds it into the baseline.
    fn fold(&mut self, cycle: u64, snapshot: &Snapshot) -> CycleReport {
        let classification = diff(snapshot, &self.baseline);

        let new_connections = classification
            .new
            .iter()
            .filter_map(|fingerprint| snapshot.get(fingerprint).cloned())
            .collect();
        let transitions = classification
            .transitions
            .iter()
            .map(|t| {
                let current = snapshot.get(&t.fingerprint);
                TransitionAlert {
                    fingerprint: t.fingerprint,
                    from: t.from,
                    to: t.to,
                    pid: current.map(|r| r.pid).unwrap_or(0),
                    process_name: current.map(|r| r.process_name.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let now = snapshot.captured_at();
        for (fingerprint, record) in snapshot.iter() {
            self.baseline.upsert(*fingerprint, record, now);
        }
        let vanished = self
            .baseline
            .evict_stale(&snapshot.fingerprints(), self.settings.grace_polls)
            .into_iter()
            .map(|(fingerprint, entry)| VanishedConnection {
                fingerprint,
                last_state: entry.record.state,
                pid: entry.record.pid,
                process_name: entry.record.process_name,
                first_seen: entry.first_seen,
                last_seen: entry.last_seen,
            })
            .collect();
        self.unsaved = true;

        CycleReport {
            cycle,
            captured_at: now,
            classification,
            new_connections,
            transitions,
            vanished,
        }
    }

    fn persist(&mut self) {
        match self.baseline.save(self.medium.as_ref()) {
            Ok(()) => {
                if self.consecutive_save_failures > 0 {
                    info!(
                        "Baseline saved to {} after {} failed attempts",
                        self.medium.location(),
                        self.consecutive_save_failures
                    );
                }
                self.consecutive_save_failures = 0;
                self.unsaved = false;
            }
            Err(e) => {
                let threshold = self.settings.persist_failure_threshold;
                let crossed = self.consecutive_save_failures <= threshold;
                self.consecutive_save_failures = self.consecutive_save_failures.saturating_add(1);
                self.stats.save_failures += 1;
                warn!(
                    "Cycle {} phase persisting: {} (failure {} in a row); keeping in-memory baseline",
                    self.cycle, e, self.consecutive_save_failures
                );
                if crossed && self.consecutive_save_failures > threshold {
                    self.sink
                        .durability_degraded(self.consecutive_save_failures, &e);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        if self.unsaved {
            debug!("Flushing baseline before stopping");
            self.enter(Phase::Persisting);
            self.persist();
            if self.unsaved {
                error!(
                    "Baseline changes since the last successful save are lost ({})",
                    self.medium.location()
                );
            }
        }
        self.enter(Phase::Stopped);
        info!(
            "Monitor stopped: {} cycles completed, {} skipped, {} failed saves",
            self.stats.cycles_completed, self.stats.cycles_skipped, self.stats.save_failures
        );
    }

    fn enter(&mut self, phase: Phase) {
        trace!("cycle {}: {:?} -> {:?}", self.cycle, self.phase, phase);
        self.phase = phase;
    }
}

/// Resolves once `stop` is true. A dropped sender can never ask us to stop,
/// so this then stays pending.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests;
