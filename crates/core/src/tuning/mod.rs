//! Online GEMM autotuning: signatures, the decision cache, its persisted
//! format and the warm-up batch-size sequence.

mod cache;
pub mod format;
mod params;
mod seq;
mod signature;

pub use cache::TuningCache;
pub use params::TuningParams;
pub use seq::{parse_tuning_seq, SeqParseError, TuningSeq, TuningSeqIter};
pub use signature::{ProblemSignature, TuningRecord};
