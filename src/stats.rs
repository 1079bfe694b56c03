use crate::pipeline::ItemOutcome;
use serde::{Deserialize, Serialize};

/// Run counters. Owned by the orchestrator; every field only grows.
///
/// `uploaded <= converted <= discovered` holds after each [`Stats::record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub discovered: u64,
    pub converted: u64,
    pub uploaded: u64,
    pub conversion_failures: u64,
    pub upload_failures: u64,
    pub skipped: u64,
}

impl Stats {
    pub fn discover(&mut self, count: u64) {
        self.discovered += count;
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Processed { .. } => {
                self.converted += 1;
                self.uploaded += 1;
            }
            ItemOutcome::ConversionFailed { .. } => self.conversion_failures += 1,
            ItemOutcome::UploadFailed { .. } => {
                self.converted += 1;
                self.upload_failures += 1;
            }
            ItemOutcome::NotFound | ItemOutcome::Skipped { .. } => self.skipped += 1,
        }
        debug_assert!(self.uploaded <= self.converted && self.converted <= self.discovered);
    }

    pub fn has_failures(&self) -> bool {
        self.conversion_failures > 0 || self.upload_failures > 0 || self.skipped > 0
    }

    /// `uploaded / discovered`, or `None` when nothing was discovered.
    pub fn success_rate(&self) -> Option<f64> {
        (self.discovered > 0).then(|| self.uploaded as f64 / self.discovered as f64)
    }
}
