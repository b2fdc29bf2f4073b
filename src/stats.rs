use std::iter::Sum;
use std::ops::AddAssign;

/// Error rate below which a load counts as successful.
pub const NORMAL_ERR_RATE: f64 = 0.01;

/// Processed/error counters for one file.
///
/// Each worker keeps its own and the orchestrator sums them after joining,
/// so the totals are exact without any shared lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub errors: u64,
}

/// Informational verdict on a finished file; it never changes what happens to the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOutcome {
    /// Nothing was stored, so there is no rate to compute.
    NothingProcessed,
    Acceptable { error_rate: f64 },
    HighErrorRate { error_rate: f64 },
}

impl LoadOutcome {
    pub fn is_high_error_rate(&self) -> bool {
        matches!(self, LoadOutcome::HighErrorRate { .. })
    }
}

impl RunStats {
    pub fn record_success(&mut self) {
        self.processed += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// `errors / processed`, or `None` when nothing was processed.
    pub fn error_rate(&self) -> Option<f64> {
        if self.processed == 0 {
            return None;
        }
        Some(self.errors as f64 / self.processed as f64)
    }

    pub fn classify(&self, threshold: f64) -> LoadOutcome {
        match self.error_rate() {
            None => LoadOutcome::NothingProcessed,
            Some(error_rate) if error_rate < threshold => LoadOutcome::Acceptable { error_rate },
            Some(error_rate) => LoadOutcome::HighErrorRate { error_rate },
        }
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.errors += rhs.errors;
    }
}

impl Sum for RunStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(RunStats::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}
