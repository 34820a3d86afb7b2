pub mod backend;
pub mod dispatch;
pub mod epilogue;
pub mod error;
pub mod lora;
pub mod moe;
pub mod tuning;
pub mod variant;
pub mod view;
pub mod warmup;
pub mod weight;

pub use backend::{CandleBackend, GemmProblem, KernelBackend};
pub use dispatch::{CacheStats, LinearDispatch};
pub use epilogue::LoraInput;
pub use error::{DispatchError, Result};
pub use lora::LowRankAdapter;
pub use moe::{ExpertMap, ExpertPlacement, RoutingContext};
pub use tuning::{ProblemSignature, TuningParams, TuningRecord, TuningSeq};
pub use variant::{Fusion, KernelVariant, OperationKind, TileShape};
pub use view::StridedView;
pub use warmup::{run_tuning_warmup, ProbeInputs, WarmupConfig, WarmupError, WarmupStats};
pub use weight::{DenseWeight, LayoutTag, WeightDescriptor, WeightFormat};
