pub mod config;
pub mod error;
mod ffi;
pub mod heuristic;
pub mod layout;
pub mod mla;
pub mod reduce;
pub mod reference;
pub mod runtime;
pub mod stage1;
pub mod tensor;

pub use config::{LaunchConfig, RuntimeConfig};
pub use error::MlaError;
pub use heuristic::{SplitCache, SplitDecision, SplitKey, resolve_splits};
pub use layout::BatchLayout;
pub use mla::{
    MlaAttention, MlaDecodeParams, MlaForwardOutput, MlaPrefillParams, mla_decode_fwd,
    mla_prefill_fwd,
};
pub use reduce::{OnlineSoftmax, ReduceParams, reduce_partials};
pub use reference::{ReferenceOutput, masked_attention};
pub use runtime::KernelRuntime;
pub use stage1::{PartialBuffers, ReferenceStage1, Stage1Inputs, Stage1Kernel, Stage1Mode};
pub use tensor::{DType, Element, Tensor3D, Tensor3DMut, Tensor4D};
