//! Thread-safe accumulation of accepted samples.
//!
//! Every operation is one short critical section on a single mutex. The
//! collection lives behind an `Arc`, so a snapshot costs one reference count
//! and later inserts copy the vector only while a snapshot is still alive.

use std::sync::Arc;

use calib_capture_core::{CorrespondenceSample, PatternSize};
use parking_lot::Mutex;

use crate::dedup::is_duplicate;

/// Immutable view of the store at one point in time.
pub type SampleSnapshot = Arc<Vec<CorrespondenceSample>>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error(
        "sample grid {}x{} differs from stored grid {}x{}",
        .got.width, .got.height, .expected.width, .expected.height
    )]
    PatternMismatch {
        expected: PatternSize,
        got: PatternSize,
    },
}

/// Result of a deduplicating insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { count: usize },
    Duplicate,
}

#[derive(Debug, Default)]
pub struct SampleStore {
    samples: Mutex<Arc<Vec<CorrespondenceSample>>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample and return the new count.
    ///
    /// All samples between two `clear` calls must share one grid size.
    pub fn insert(&self, sample: CorrespondenceSample) -> Result<usize, StoreError> {
        let mut guard = self.samples.lock();
        check_pattern(&guard, &sample)?;
        let samples = Arc::make_mut(&mut guard);
        samples.push(sample);
        Ok(samples.len())
    }

    /// Check for a near-duplicate and append in the same critical section.
    pub fn insert_unless_duplicate(
        &self,
        sample: CorrespondenceSample,
        threshold: f64,
    ) -> Result<InsertOutcome, StoreError> {
        let mut guard = self.samples.lock();
        check_pattern(&guard, &sample)?;
        if is_duplicate(sample.image_points(), &guard, threshold) {
            return Ok(InsertOutcome::Duplicate);
        }
        let samples = Arc::make_mut(&mut guard);
        samples.push(sample);
        Ok(InsertOutcome::Inserted {
            count: samples.len(),
        })
    }

    pub fn snapshot(&self) -> SampleSnapshot {
        Arc::clone(&self.samples.lock())
    }

    pub fn clear(&self) {
        *self.samples.lock() = Arc::new(Vec::new());
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

fn check_pattern(
    samples: &[CorrespondenceSample],
    sample: &CorrespondenceSample,
) -> Result<(), StoreError> {
    match samples.first() {
        Some(first) if first.pattern_size() != sample.pattern_size() => {
            Err(StoreError::PatternMismatch {
                expected: first.pattern_size(),
                got: sample.pattern_size(),
            })
        }
        _ => Ok(()),
    }
}
