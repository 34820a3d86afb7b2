//! Batch sizes visited while populating the tuning cache.

use std::sync::Arc;

use thiserror::Error;

/// Errors from [`parse_tuning_seq`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeqParseError {
    #[error("invalid batch size {0:?}")]
    InvalidNumber(String),

    #[error("malformed range {0:?}, expected start:end:step")]
    MalformedRange(String),

    #[error("range {0:?} has a zero step")]
    ZeroStep(String),

    #[error("batch size must be > 0")]
    ZeroBatch,

    #[error("tuning sequence is empty")]
    Empty,
}

/// Sizes below this double; above it every power-of-two octave is split
/// into four evenly spaced sizes.
const DOUBLING_LIMIT: usize = 16;
const STEPS_PER_OCTAVE: usize = 4;

/// Ascending, finite, restartable sequence of batch sizes.
///
/// Cloning is cheap and every call to [`TuningSeq::iter`] starts over. The
/// default progression is generated lazily: 1, 2, 4, 8, 16, 20, 24, 28, 32,
/// 40, 48, ... up to and always including `max_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningSeq {
    source: SeqSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SeqSource {
    Progression { max_batch: usize },
    Explicit(Arc<[usize]>),
}

impl TuningSeq {
    pub fn progression(max_batch: usize) -> Self {
        Self {
            source: SeqSource::Progression {
                max_batch: max_batch.max(1),
            },
        }
    }

    /// Use exactly these sizes (sorted and deduplicated).
    pub fn explicit(sizes: &[usize]) -> Result<Self, SeqParseError> {
        let mut sizes = sizes.to_vec();
        if sizes.contains(&0) {
            return Err(SeqParseError::ZeroBatch);
        }
        sizes.sort_unstable();
        sizes.dedup();
        if sizes.is_empty() {
            return Err(SeqParseError::Empty);
        }
        Ok(Self {
            source: SeqSource::Explicit(sizes.into()),
        })
    }

    pub fn iter(&self) -> TuningSeqIter {
        let state = match &self.source {
            SeqSource::Progression { max_batch } => IterState::Progression {
                next: Some(1),
                max_batch: *max_batch,
            },
            SeqSource::Explicit(sizes) => IterState::Explicit {
                sizes: Arc::clone(sizes),
                pos: 0,
            },
        };
        TuningSeqIter { state }
    }

    /// Largest size in the sequence.
    pub fn max_batch(&self) -> usize {
        match &self.source {
            SeqSource::Progression { max_batch } => *max_batch,
            SeqSource::Explicit(sizes) => sizes.last().copied().unwrap_or(0),
        }
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a TuningSeq {
    type Item = usize;
    type IntoIter = TuningSeqIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`TuningSeq`].
#[derive(Debug, Clone)]
pub struct TuningSeqIter {
    state: IterState,
}

#[derive(Debug, Clone)]
enum IterState {
    Progression {
        next: Option<usize>,
        max_batch: usize,
    },
    Explicit {
        sizes: Arc<[usize]>,
        pos: usize,
    },
}

fn step_after(size: usize) -> usize {
    if size < DOUBLING_LIMIT {
        size * 2
    } else {
        // Largest power of two not above `size`.
        let octave = 1usize << (usize::BITS - 1 - size.leading_zeros());
        size + octave / STEPS_PER_OCTAVE
    }
}

impl Iterator for TuningSeqIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match &mut self.state {
            IterState::Progression { next, max_batch } => {
                let current = (*next)?;
                if current >= *max_batch {
                    *next = None;
                    return Some(*max_batch);
                }
                *next = Some(step_after(current));
                Some(current)
            }
            IterState::Explicit { sizes, pos } => {
                let v = sizes.get(*pos).copied()?;
                *pos += 1;
                Some(v)
            }
        }
    }
}

/// Parse `"1,2,4,16:64:16,128"` into a sorted, deduplicated list.
///
/// Each comma-separated item is a batch size or an inclusive
/// `start:end:step` range.
pub fn parse_tuning_seq(spec: &str) -> Result<Vec<usize>, SeqParseError> {
    let parse = |s: &str| -> Result<usize, SeqParseError> {
        s.trim()
            .parse::<usize>()
            .map_err(|_| SeqParseError::InvalidNumber(s.trim().to_string()))
    };

    let mut sizes = Vec::new();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = item.split(':').collect();
        match parts.as_slice() {
            [single] => sizes.push(parse(single)?),
            [start, end, step] => {
                let (start, end, step) = (parse(start)?, parse(end)?, parse(step)?);
                if step == 0 {
                    return Err(SeqParseError::ZeroStep(item.to_string()));
                }
                if start > end {
                    return Err(SeqParseError::MalformedRange(item.to_string()));
                }
                sizes.extend((start..=end).step_by(step));
            }
            _ => return Err(SeqParseError::MalformedRange(item.to_string())),
        }
    }

    if sizes.contains(&0) {
        return Err(SeqParseError::ZeroBatch);
    }
    sizes.sort_unstable();
    sizes.dedup();
    if sizes.is_empty() {
        return Err(SeqParseError::Empty);
    }
    Ok(sizes)
}
