//! Classifies a snapshot against the baseline.
//!
//! Works purely on fingerprints plus the stored state payload; it never
//! mutates the baseline and never sees a failed enumeration.

use crate::baseline::BaselineStore;
use crate::connection::{ConnectionState, Fingerprint};
use crate::snapshot::Snapshot;
use serde::Serialize;
use std::collections::BTreeSet;

/// Same socket tuple, different state since the last poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub fingerprint: Fingerprint,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// In the snapshot, unknown to the baseline
    pub new: BTreeSet<Fingerprint>,
    /// In both
    pub unchanged: BTreeSet<Fingerprint>,
    /// Known but absent this poll; eviction is up to the grace period
    pub vanished: BTreeSet<Fingerprint>,
    /// Subset of `unchanged` whose state moved
    pub transitions: Vec<StateTransition>,
}

pub fn diff(current: &Snapshot, baseline: &BaselineStore) -> Classification {
    let mut classification = Classification::default();

    for (fingerprint, record) in current.iter() {
        match baseline.get(fingerprint) {
            None => {
                classification.new.insert(*fingerprint);
            }
            Some(known) => {
                classification.unchanged.insert(*fingerprint);
                if known.record.state != record.state {
                    classification.transitions.push(StateTransition {
                        fingerprint: *fingerprint,
                        from: known.record.state,
                        to: record.state,
                    });
                }
            }
        }
    }

    classification.vanished = baseline
        .iter()
        .map(|(fingerprint, _)| *fingerprint)
        .filter(|fingerprint| !current.contains(fingerprint))
        .collect();

    classification
}
