pub mod config;
pub mod errors;
pub mod folding;
pub mod graph;
pub mod onnx_proto;
pub mod onnx_utils;
pub mod quantization;

pub use config::Config;
pub use errors::{FoldError, Result};
pub use folding::{
    convert_to_deployable_onnx, convert_to_deployable_onnx_with, fold_graph, fold_model, Conversion,
    FoldReport,
};
pub use graph::Graph;
pub use onnx_utils::{ModelInfo, OnnxModel, SaveLayout, SaveOptions};
pub use quantization::{
    pack_int4, quantize_tensor, unpack_int4, ClipWarning, QuantParams, QuantTarget,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
