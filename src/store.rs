//! Local reconciliation store
//!
//! Merges an unordered stream of [`LocationSample`]s into one current
//! position per participant. The policy is last-observed-wins: a sample
//! replaces the stored one wholesale, in local receipt order. When both
//! the stored and the incoming sample carry a `seq`, a lower `seq` is
//! rejected so a reordered delivery cannot regress a position.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::location::{LocationSample, ParticipantId};

/// What [`LocationTable::apply_sample`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First sample for this id
    Inserted,
    /// Replaced a different stored sample
    Updated,
    /// Identical to the stored sample
    Unchanged,
    /// Older `seq` than the stored sample; dropped
    Stale,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    sample: LocationSample,
    last_seen: DateTime<Utc>,
}

/// Participant id -> most recently observed sample.
#[derive(Debug, Default, Clone)]
pub struct LocationTable {
    entries: HashMap<ParticipantId, Entry>,
    // ids in order of first appearance
    order: Vec<ParticipantId>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_sample(&mut self, sample: LocationSample) -> ApplyOutcome {
        self.apply_sample_at(sample, Utc::now())
    }

    pub fn apply_sample_at(&mut self, sample: LocationSample, now: DateTime<Utc>) -> ApplyOutcome {
        match self.entries.get_mut(&sample.id) {
            Some(entry) => {
                if let (Some(stored), Some(incoming)) = (entry.sample.seq, sample.seq) {
                    if incoming < stored {
                        tracing::debug!(
                            id = %sample.id,
                            stored,
                            incoming,
                            "dropping out-of-order sample"
                        );
                        return ApplyOutcome::Stale;
                    }
                }

                entry.last_seen = now;
                if entry.sample == sample {
                    ApplyOutcome::Unchanged
                } else {
                    entry.sample = sample;
                    ApplyOutcome::Updated
                }
            }
            None => {
                self.order.push(sample.id.clone());
                self.entries.insert(
                    sample.id.clone(),
                    Entry {
                        sample,
                        last_seen: now,
                    },
                );
                ApplyOutcome::Inserted
            }
        }
    }

    /// Decode and apply an inbound event payload.
    ///
    /// Malformed payloads are dropped and leave the table untouched.
    pub fn apply_payload(&mut self, payload: &Value) -> Option<ApplyOutcome> {
        match LocationSample::from_payload(payload) {
            Ok(sample) => Some(self.apply_sample(sample)),
            Err(e) => {
                tracing::debug!("ignoring {payload}: {e}");
                None
            }
        }
    }

    /// Snapshot of every known participant, in order of first appearance.
    pub fn get_all(&self) -> Vec<LocationSample> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.sample.clone())
            .collect()
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&LocationSample> {
        self.entries.get(id).map(|entry| &entry.sample)
    }

    pub fn last_seen(&self, id: &ParticipantId) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|entry| entry.last_seen)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop participants not heard from within `max_age`; returns their ids.
    pub fn sweep_stale(&mut self, max_age: Duration) -> Vec<ParticipantId> {
        self.sweep(max_age, Utc::now(), None)
    }

    /// Like [`sweep_stale`](Self::sweep_stale), but never drops `keep`.
    pub fn sweep_stale_except(&mut self, max_age: Duration, keep: &ParticipantId) -> Vec<ParticipantId> {
        self.sweep(max_age, Utc::now(), Some(keep))
    }

    pub fn sweep_stale_at(&mut self, max_age: Duration, now: DateTime<Utc>) -> Vec<ParticipantId> {
        self.sweep(max_age, now, None)
    }

    fn sweep(
        &mut self,
        max_age: Duration,
        now: DateTime<Utc>,
        keep: Option<&ParticipantId>,
    ) -> Vec<ParticipantId> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let expired: Vec<ParticipantId> = self
            .order
            .iter()
            .filter(|id| Some(*id) != keep)
            .filter(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|entry| entry.last_seen < cutoff)
            })
            .cloned()
            .collect();

        if !expired.is_empty() {
            for id in &expired {
                self.entries.remove(id);
            }
            self.order.retain(|id| self.entries.contains_key(id));
            tracing::info!(count = expired.len(), "expired stale participants");
        }

        expired
    }
}
