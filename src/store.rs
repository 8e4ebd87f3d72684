//! In-memory sample store with duplicate detection.
//!
//! The device keeps re-sending its last reading while the sensor is idle, so
//! a sample equal to the previous one is reported as [`Staleness::Stale`].
//! Whether such samples are also appended is decided by [`DedupPolicy`].

use std::path::Path;
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;
use crate::record::{self, RecordMetadata};
use crate::telemetry::Sample;

/// What to do with a sample identical to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Store every sample; staleness only feeds the status signal.
    AlwaysAppend,
    /// Drop consecutive duplicates so the plotted series has no repeated points.
    #[default]
    SuppressDuplicates,
}

/// Verdict returned by [`SampleStore::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale,
}

impl Staleness {
    pub fn is_stale(self) -> bool {
        self == Staleness::Stale
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    samples: Vec<Sample>,
    policy: DedupPolicy,
    last_received: Option<Sample>,
    last_seen: Option<Instant>,
    last_fresh: Option<Instant>,
}

impl SampleStore {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Record a newly received sample.
    pub fn push(&mut self, sample: Sample) -> Staleness {
        let now = Instant::now();
        let verdict = if self.last_received == Some(sample) {
            Staleness::Stale
        } else {
            Staleness::Fresh
        };

        self.last_seen = Some(now);
        self.last_received = Some(sample);

        match (verdict, self.policy) {
            (Staleness::Fresh, _) => {
                self.last_fresh = Some(now);
                self.samples.push(sample);
            }
            (Staleness::Stale, DedupPolicy::AlwaysAppend) => self.samples.push(sample),
            (Staleness::Stale, DedupPolicy::SuppressDuplicates) => {}
        }
        verdict
    }

    /// Clear samples and staleness state.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_received = None;
        self.last_seen = None;
        self.last_fresh = None;
    }

    /// Replace the whole series, e.g. after an import.
    pub fn replace(&mut self, samples: Vec<Sample>) {
        self.reset();
        self.last_received = samples.last().copied();
        self.samples = samples;
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.clone()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of the last received sample, stale or not.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// True if a fresh sample arrived within `window` of `now`.
    pub fn fresh_within(&self, now: Instant, window: Duration) -> bool {
        self.last_fresh
            .is_some_and(|t| now.saturating_duration_since(t) <= window)
    }

    pub fn export(&self, path: impl AsRef<Path>, metadata: &RecordMetadata) -> Result<(), RecordError> {
        record::export(path, &self.samples, metadata)
    }

    /// Load a record file into this store. The store is untouched on error.
    pub fn import(&mut self, path: impl AsRef<Path>) -> Result<RecordMetadata, RecordError> {
        let (samples, metadata) = record::import(path)?;
        debug!(
            "imported {} samples (model={})",
            samples.len(),
            metadata.model
        );
        self.replace(samples);
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_sample_is_stale() {
        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        assert_eq!(store.push(Sample::new(1.0, 2.0)), Staleness::Fresh);
        assert_eq!(store.push(Sample::new(1.0, 2.0)), Staleness::Stale);
        assert_eq!(store.push(Sample::new(1.0, 3.0)), Staleness::Fresh);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn distinct_samples_are_never_stale() {
        let mut store = SampleStore::new(DedupPolicy::AlwaysAppend);
        for i in 0..10 {
            assert_eq!(store.push(Sample::new(i as f64, 0.0)), Staleness::Fresh);
        }
    }

    #[test]
    fn staleness_only_compares_with_the_previous_sample() {
        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.push(Sample::new(1.0, 1.0));
        store.push(Sample::new(2.0, 2.0));
        assert_eq!(store.push(Sample::new(1.0, 1.0)), Staleness::Fresh);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn always_append_keeps_duplicates() {
        let mut store = SampleStore::new(DedupPolicy::AlwaysAppend);
        assert_eq!(store.policy(), DedupPolicy::AlwaysAppend);
        store.push(Sample::new(5.0, 5.0));
        assert!(store.push(Sample::new(5.0, 5.0)).is_stale());
        assert_eq!(store.samples(), &[Sample::new(5.0, 5.0); 2]);
    }

    #[test]
    fn stale_push_updates_last_seen_but_not_freshness() {
        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.push(Sample::new(1.0, 1.0));
        let first_seen = store.last_seen().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.push(Sample::new(1.0, 1.0));
        assert!(store.last_seen().unwrap() > first_seen);

        let now = Instant::now();
        assert!(!store.fresh_within(now, Duration::from_millis(5)));
        assert!(store.fresh_within(now, Duration::from_secs(5)));
    }

    #[test]
    fn reset_clears_everything() {
        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.push(Sample::new(1.0, 1.0));
        store.reset();
        assert!(store.is_empty());
        assert!(store.last_seen().is_none());
        assert_eq!(store.push(Sample::new(1.0, 1.0)), Staleness::Fresh);
    }

    #[test]
    fn export_and_import_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.csv");

        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.push(Sample::new(0.0, 1.0));
        store.push(Sample::new(2.0, 3.5));
        store
            .export(&path, &RecordMetadata::with_model("LP-7"))
            .unwrap();

        let mut other = SampleStore::new(DedupPolicy::AlwaysAppend);
        let meta = other.import(&path).unwrap();
        assert_eq!(meta.model, "LP-7");
        assert_eq!(other.samples(), store.samples());
    }

    #[test]
    fn failed_import_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "X,Y\n1,2\nnot a row\n").unwrap();

        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.push(Sample::new(9.0, 9.0));
        assert!(matches!(
            store.import(&path),
            Err(RecordError::InvalidRow { line: 3, .. })
        ));
        assert_eq!(store.samples(), &[Sample::new(9.0, 9.0)]);
    }

    #[test]
    fn replace_continues_staleness_from_last_loaded_sample() {
        let mut store = SampleStore::new(DedupPolicy::SuppressDuplicates);
        store.replace(vec![Sample::new(0.0, 0.0), Sample::new(1.0, 4.0)]);
        assert_eq!(store.push(Sample::new(1.0, 4.0)), Staleness::Stale);
        assert_eq!(store.len(), 2);
    }
}
