use super::*;
use crate::baseline::BaselineStore;
use crate::connection::{ConnectionRecord, ConnectionState, Fingerprint};
use crate::error::SnapshotError;
use crate::testing::{at, scenario_record, tcp, MemoryMedium, RecordingSink, ScriptedSource};
use std::sync::Mutex;

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn starting(minute: u32) -> Arc<Self> {
        Arc::new(ManualClock(Mutex::new(at(minute))))
    }

    fn set(&self, minute: u32) {
        *self.0.lock().unwrap() = at(minute);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

fn settings() -> MonitorSettings {
    MonitorSettings {
        interval: Duration::from_secs(5),
        snapshot_timeout: Duration::from_secs(2),
        grace_polls: 2,
        persist_failure_threshold: 3,
    }
}

struct Harness {
    monitor: Monitor,
    source: Arc<ScriptedSource>,
    medium: MemoryMedium,
    sink: RecordingSink,
    clock: Arc<ManualClock>,
}

fn harness(
    settings: MonitorSettings,
    script: Vec<Result<Vec<ConnectionRecord>, SnapshotError>>,
    medium: MemoryMedium,
) -> Harness {
    let source = ScriptedSource::new(script);
    let sink = RecordingSink::default();
    let clock = ManualClock::starting(0);
    let baseline = BaselineStore::load(&medium).unwrap();
    let monitor = Monitor::new(
        settings,
        source.clone(),
        ConnectionFilter::permissive(),
        Box::new(medium.clone()),
        baseline,
        Box::new(sink.clone()),
        clock.clone(),
    );
    Harness {
        monitor,
        source,
        medium,
        sink,
        clock,
    }
}

fn running() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn persisted(medium: &MemoryMedium) -> BaselineStore {
    BaselineStore::load(medium).unwrap()
}

#[tokio::test]
async fn first_sighting_is_reported_and_persisted() {
    let mut h = harness(settings(), vec![Ok(vec![scenario_record()])], MemoryMedium::default());
    h.clock.set(7);

    let outcome = h.monitor.run_cycle(&running()).await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            new: 1,
            transitions: 0,
            vanished: 0
        }
    );
    let recorded = h.sink.recorded.lock().unwrap();
    assert_eq!(recorded.reports.len(), 1);
    assert_eq!(recorded.reports[0].new_connections, vec![scenario_record()]);

    let store = persisted(&h.medium);
    let entry = store.get(&scenario_record().fingerprint()).unwrap();
    assert_eq!(entry.first_seen, at(7));
    assert_eq!(entry.last_seen, at(7));
    assert_eq!(h.monitor.phase(), Phase::Idle);
}

#[tokio::test]
async fn state_change_is_a_transition_not_a_new_connection() {
    let mut closing = scenario_record();
    closing.state = ConnectionState::CloseWait;
    let mut h = harness(
        settings(),
        vec![Ok(vec![scenario_record()]), Ok(vec![closing])],
        MemoryMedium::default(),
    );
    let stop = running();

    h.monitor.run_cycle(&stop).await;
    h.clock.set(1);
    let outcome = h.monitor.run_cycle(&stop).await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            new: 0,
            transitions: 1,
            vanished: 0
        }
    );
    let recorded = h.sink.recorded.lock().unwrap();
    let report = &recorded.reports[1];
    assert!(report.new_connections.is_empty());
    assert_eq!(report.transitions[0].from, ConnectionState::Established);
    assert_eq!(report.transitions[0].to, ConnectionState::CloseWait);
    assert_eq!(report.transitions[0].process_name, "curl");

    let entry = h.monitor.baseline().get(&scenario_record().fingerprint()).unwrap().clone();
    assert_eq!(entry.record.state, ConnectionState::CloseWait);
    assert_eq!(entry.first_seen, at(0));
    assert_eq!(entry.last_seen, at(1));
}

#[tokio::test]
async fn connection_vanishes_only_after_grace_period() {
    let mut h = harness(
        settings(),
        vec![Ok(vec![scenario_record()]), Ok(vec![]), Ok(vec![])],
        MemoryMedium::default(),
    );
    let stop = running();
    let fingerprint = scenario_record().fingerprint();

    h.monitor.run_cycle(&stop).await;
    h.monitor.run_cycle(&stop).await;
    assert_eq!(h.monitor.baseline().get(&fingerprint).unwrap().missed_polls, 1);

    let outcome = h.monitor.run_cycle(&stop).await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            new: 0,
            transitions: 0,
            vanished: 1
        }
    );
    assert!(!h.monitor.baseline().contains(&fingerprint));
    assert!(!persisted(&h.medium).contains(&fingerprint));

    let recorded = h.sink.recorded.lock().unwrap();
    assert!(recorded.reports[1].vanished.is_empty());
    assert_eq!(recorded.reports[2].vanished[0].fingerprint, fingerprint);
    assert_eq!(recorded.reports[2].vanished[0].last_state, ConnectionState::Established);
}

#[tokio::test]
async fn restart_does_not_report_known_connections() {
    let medium = MemoryMedium::default();
    {
        let mut first = harness(settings(), vec![Ok(vec![scenario_record()])], medium.clone());
        first.monitor.run_cycle(&running()).await;
    }

    let mut restarted_process = scenario_record();
    restarted_process.pid = 4242;
    restarted_process.process_name = "curl-new".to_string();
    let mut h = harness(settings(), vec![Ok(vec![restarted_process])], medium);

    let outcome = h.monitor.run_cycle(&running()).await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            new: 0,
            transitions: 0,
            vanished: 0
        }
    );
    let entry = h.monitor.baseline().get(&scenario_record().fingerprint()).unwrap().clone();
    assert_eq!(entry.record.pid, 4242);
}

#[tokio::test]
async fn failed_snapshot_leaves_baseline_untouched() {
    let other = tcp("10.0.0.1", 5001, "93.1.1.2", 443);
    let mut h = harness(
        settings(),
        vec![
            Ok(vec![scenario_record()]),
            Err(SnapshotError::Unsupported),
            Ok(vec![scenario_record(), other.clone()]),
        ],
        MemoryMedium::default(),
    );
    let stop = running();

    h.monitor.run_cycle(&stop).await;
    let before = h.monitor.baseline().clone();
    let writes = h.medium.write_count();

    assert_eq!(h.monitor.run_cycle(&stop).await, CycleOutcome::SnapshotFailed);
    assert_eq!(h.monitor.baseline(), &before);
    assert_eq!(h.medium.write_count(), writes);
    assert_eq!(h.sink.recorded.lock().unwrap().reports.len(), 1);

    // the failure does not count as a missed poll
    let entry = h.monitor.baseline().get(&scenario_record().fingerprint()).unwrap();
    assert_eq!(entry.missed_polls, 0);

    h.monitor.run_cycle(&stop).await;
    let recorded = h.sink.recorded.lock().unwrap();
    assert_eq!(recorded.reports[1].new_connections, vec![other]);
    assert_eq!(h.monitor.stats().cycles_skipped, 1);
    assert_eq!(h.monitor.stats().cycles_completed, 2);
}

#[tokio::test]
async fn empty_table_ages_entries_instead_of_being_ignored() {
    let mut h = harness(
        settings(),
        vec![Ok(vec![scenario_record()]), Ok(vec![])],
        MemoryMedium::default(),
    );
    let stop = running();

    h.monitor.run_cycle(&stop).await;
    let outcome = h.monitor.run_cycle(&stop).await;

    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    let entry = h.monitor.baseline().get(&scenario_record().fingerprint()).unwrap();
    assert_eq!(entry.missed_polls, 1);
}

#[tokio::test]
async fn degraded_durability_is_alerted_once_per_streak() {
    let mut config = settings();
    config.persist_failure_threshold = 2;
    let medium = MemoryMedium::default();
    medium.set_fail_writes(true);
    let mut h = harness(config, vec![Ok(vec![scenario_record()])], medium);
    let stop = running();

    for _ in 0..5 {
        h.monitor.run_cycle(&stop).await;
    }
    assert_eq!(h.sink.recorded.lock().unwrap().degraded, vec![3]);
    assert_eq!(h.monitor.stats().save_failures, 5);
    assert!(h.medium.contents().is_none());
    // tracking goes on in memory
    assert!(h.monitor.baseline().contains(&scenario_record().fingerprint()));

    h.medium.set_fail_writes(false);
    h.monitor.run_cycle(&stop).await;
    assert!(persisted(&h.medium).contains(&scenario_record().fingerprint()));

    h.medium.set_fail_writes(true);
    for _ in 0..3 {
        h.monitor.run_cycle(&stop).await;
    }
    assert_eq!(h.sink.recorded.lock().unwrap().degraded, vec![3, 3]);
}

#[tokio::test]
async fn largest_failure_threshold_never_alerts_and_keeps_polling() {
    let mut config = settings();
    config.persist_failure_threshold = u32::MAX;
    let medium = MemoryMedium::default();
    medium.set_fail_writes(true);
    let mut h = harness(config, vec![Ok(vec![scenario_record()])], medium);
    let stop = running();

    for _ in 0..3 {
        let outcome = h.monitor.run_cycle(&stop).await;
        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    }

    assert!(h.sink.recorded.lock().unwrap().degraded.is_empty());
    assert_eq!(h.monitor.stats().save_failures, 3);
}

/// Asks the monitor to stop while its own enumeration is in progress.
struct StopDuringSnapshot {
    stop: watch::Sender<bool>,
}

impl SnapshotSource for StopDuringSnapshot {
    fn name(&self) -> &'static str {
        "stop-during-snapshot"
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>, SnapshotError> {
        let _ = self.stop.send(true);
        Ok(vec![scenario_record()])
    }
}

#[tokio::test]
async fn stop_during_snapshot_discards_it() {
    let (tx, rx) = watch::channel(false);
    let medium = MemoryMedium::default();
    let sink = RecordingSink::default();
    let mut monitor = Monitor::new(
        settings(),
        Arc::new(StopDuringSnapshot { stop: tx }),
        ConnectionFilter::permissive(),
        Box::new(medium.clone()),
        BaselineStore::new(),
        Box::new(sink.clone()),
        ManualClock::starting(0),
    );

    let outcome = monitor.run_cycle(&rx).await;

    assert_eq!(outcome, CycleOutcome::Stopped);
    assert!(monitor.baseline().is_empty());
    assert_eq!(monitor.phase(), Phase::Idle);
    assert!(sink.recorded.lock().unwrap().reports.is_empty());
    assert_eq!(medium.write_count(), 0);
    assert_eq!(monitor.stats().cycles_completed, 0);
}

#[tokio::test]
async fn stop_before_snapshot_skips_the_cycle() {
    let mut h = harness(settings(), vec![Ok(vec![scenario_record()])], MemoryMedium::default());
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    assert_eq!(h.monitor.run_cycle(&rx).await, CycleOutcome::Stopped);
    assert_eq!(h.source.calls(), 0);
    assert!(h.monitor.baseline().is_empty());
}

#[tokio::test(start_paused = true)]
async fn polls_on_schedule_until_stopped() {
    let h = harness(settings(), vec![Ok(vec![scenario_record()])], MemoryMedium::default());
    let source = h.source.clone();
    let medium = h.medium.clone();
    let sink = h.sink.clone();
    let mut monitor = h.monitor;
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let stats = monitor.run(rx).await;
        (monitor, stats)
    });

    // ticks at 0s, 5s and 10s
    tokio::time::sleep(Duration::from_secs(11)).await;
    tx.send(true).unwrap();
    let (monitor, stats) = handle.await.unwrap();

    assert_eq!(stats.cycles_completed, 3);
    assert_eq!(source.calls(), 3);
    assert_eq!(monitor.phase(), Phase::Stopped);
    assert_eq!(sink.recorded.lock().unwrap().reports[0].new_connections.len(), 1);
    assert!(sink.recorded.lock().unwrap().reports[1..]
        .iter()
        .all(|r| r.new_connections.is_empty()));
    assert!(persisted(&medium).contains(&scenario_record().fingerprint()));
}

#[tokio::test(start_paused = true)]
async fn stop_requested_before_start_runs_nothing() {
    let h = harness(settings(), vec![Ok(vec![scenario_record()])], MemoryMedium::default());
    let mut monitor = h.monitor;
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let stats = monitor.run(rx).await;

    assert_eq!(stats, RunStats::default());
    assert_eq!(h.source.calls(), 0);
    assert_eq!(h.medium.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unsaved_changes_are_flushed_on_stop() {
    let medium = MemoryMedium::default();
    medium.set_fail_writes(true);
    let h = harness(settings(), vec![Ok(vec![scenario_record()])], medium);
    let medium = h.medium.clone();
    let mut monitor = h.monitor;
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { monitor.run(rx).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(medium.contents().is_none());
    medium.set_fail_writes(false);
    tx.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.save_failures, 1);
    let fingerprint: Fingerprint = scenario_record().fingerprint();
    assert!(persisted(&medium).contains(&fingerprint));
}

#[tokio::test]
async fn run_once_completes_one_cycle_and_stops() {
    let mut h = harness(settings(), vec![Ok(vec![scenario_record()])], MemoryMedium::default());

    let outcome = h.monitor.run_once().await;

    assert!(matches!(outcome, CycleOutcome::Completed { new: 1, .. }));
    assert_eq!(h.source.calls(), 1);
    assert_eq!(h.monitor.phase(), Phase::Stopped);
    assert!(persisted(&h.medium).contains(&scenario_record().fingerprint()));
}

#[test]
fn settings_follow_monitor_config() {
    let config = MonitorConfig {
        interval_seconds: 10,
        grace_polls: 4,
        ..MonitorConfig::default()
    };
    let settings = MonitorSettings::from(&config);
    assert_eq!(settings.interval, Duration::from_secs(10));
    assert_eq!(settings.snapshot_timeout, Duration::from_secs(5));
    assert_eq!(settings.grace_polls, 4);
    assert_eq!(settings.persist_failure_threshold, 3);
}
