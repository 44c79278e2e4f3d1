//! Constant folding of weight QuantizeLinear nodes.
//!
//! QDQ exporters leave every quantized weight as `float constant ->
//! QuantizeLinear -> DequantizeLinear`. Runtimes that execute the integer
//! kernels want the weight already stored as integers, so this pass
//! evaluates each weight QuantizeLinear ahead of time and feeds the result
//! straight into its DequantizeLinear. Float biases of quantized
//! Gemm/Conv/ConvTranspose nodes are folded to int32 alongside.

pub mod matcher;
pub mod quantization_nodes;
pub mod rewriter;

pub use matcher::{find_fold_sites, BiasLeg, FoldSite};
pub use rewriter::apply_folds;

use crate::errors::{FoldError, Result};
use crate::graph::{cleanup, Graph};
use crate::onnx_utils::{OnnxModel, SaveLayout, SaveOptions};
use crate::quantization::ClipWarning;
use std::path::Path;

/// Summary of one folding pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoldReport {
    pub folded_weights: usize,
    pub folded_biases: usize,
    pub removed_nodes: usize,
    pub removed_constants: usize,
    /// Clip diagnostics, in the order they were raised.
    pub warnings: Vec<ClipWarning>,
}

impl FoldReport {
    pub fn is_noop(&self) -> bool {
        self.folded_weights == 0 && self.folded_biases == 0 && self.removed_nodes == 0
    }
}

/// Match, rewrite and clean up `graph` in memory.
///
/// A graph without foldable sites is still cleaned and sorted.
pub fn fold_graph(graph: &mut Graph) -> Result<FoldReport> {
    let sites = find_fold_sites(graph);
    tracing::debug!("found {} fold sites in graph '{}'", sites.len(), graph.name);

    let mut report = apply_folds(graph, &sites)?;
    let stats = cleanup::cleanup(graph)?;
    report.removed_nodes = stats.removed_nodes;
    report.removed_constants = stats.removed_constants;
    Ok(report)
}

/// Fold `model` in memory: lift its graph, fold, and lower it back.
pub fn fold_model(model: &mut OnnxModel) -> Result<FoldReport> {
    let mut graph = model.graph()?;
    let report = fold_graph(&mut graph)?;
    model.set_graph(&graph)?;

    let connectivity = model.validate_connectivity();
    if !connectivity.valid {
        return Err(FoldError::graph(format!(
            "folded graph is disconnected: {}",
            connectivity.summary()
        )));
    }
    Ok(report)
}

/// Outcome of an in-place conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub report: FoldReport,
    pub layout: SaveLayout,
}

/// Fold the model at `path` and overwrite it, using default save options.
pub fn convert_to_deployable_onnx(path: impl AsRef<Path>) -> Result<Conversion> {
    convert_to_deployable_onnx_with(path, &SaveOptions::default())
}

/// Fold the model at `path` and overwrite it.
///
/// Any failure is reported as a single [`FoldError::Conversion`] and leaves
/// the file on disk untouched.
pub fn convert_to_deployable_onnx_with(
    path: impl AsRef<Path>,
    options: &SaveOptions,
) -> Result<Conversion> {
    let path = path.as_ref();
    convert_in_place(path, options).map_err(|source| FoldError::Conversion {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn convert_in_place(path: &Path, options: &SaveOptions) -> Result<Conversion> {
    let mut model = OnnxModel::load(path)?;
    let report = fold_model(&mut model)?;
    let layout = model.save(path, options)?;
    tracing::info!(
        "Converted {}: {} weights, {} biases folded, {} nodes removed",
        path.display(),
        report.folded_weights,
        report.folded_biases,
        report.removed_nodes
    );
    Ok(Conversion { report, layout })
}
