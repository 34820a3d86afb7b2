//! Measurement-mode parameters.

use serde::{Deserialize, Serialize};

use crate::tuning::seq::{parse_tuning_seq, SeqParseError, TuningSeq};

/// How candidates are benchmarked and which batch sizes warm-up visits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Untimed runs per candidate before measuring.
    pub warmup_iters: usize,
    /// Timed runs per candidate; the recorded cost is their mean.
    pub timed_iters: usize,
    /// Largest batch size the default progression reaches.
    pub max_batch: usize,
    /// Explicit sequence such as `"1,2,4,16:256:16"`; overrides the
    /// progression when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<String>,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            warmup_iters: 0,
            timed_iters: 1,
            max_batch: 8192,
            seq: None,
        }
    }
}

impl TuningParams {
    pub fn with_iters(mut self, warmup_iters: usize, timed_iters: usize) -> Self {
        self.warmup_iters = warmup_iters;
        self.timed_iters = timed_iters;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_seq(mut self, seq: impl Into<String>) -> Self {
        self.seq = Some(seq.into());
        self
    }

    /// Timed runs, never less than one.
    pub fn effective_timed_iters(&self) -> usize {
        self.timed_iters.max(1)
    }

    /// Build the warm-up sequence these parameters describe.
    pub fn tuning_seq(&self) -> Result<TuningSeq, SeqParseError> {
        match &self.seq {
            Some(spec) => TuningSeq::explicit(&parse_tuning_seq(spec)?),
            None => {
                if self.max_batch == 0 {
                    return Err(SeqParseError::ZeroBatch);
                }
                Ok(TuningSeq::progression(self.max_batch))
            }
        }
    }
}
