//! Names and builders for the graph elements a fold introduces.
//!
//! A folded weight becomes one new initializer; the DequantizeLinear node
//! that consumed the QuantizeLinear output is rewired to it:
//!
//! ```text
//! before:  w (f32) ─► QuantizeLinear ─► q ─► DequantizeLinear ─► Conv
//! after:   q_folded (int)             ─────► DequantizeLinear ─► Conv
//! ```
//!
//! A folded bias gets a fresh DequantizeLinear of its own:
//!
//! ```text
//! Initializers:
//!   "{bias}_folded"       INT32, same shape as the float bias
//!   "{bias}_scales"       FP32, input_scale × weight_scale
//!   "{bias}_zero_points"  INT32 zeros
//! Node:
//!   DequantizeLinear
//!     inputs:  ["{bias}_folded", "{bias}_scales", "{bias}_zero_points"]
//!     outputs: ["{bias}_dq"]   ← becomes the consumer's third input
//! ```

use crate::graph::{Constant, Graph, Node, OpKind, TensorData};

/// Name of the folded initializer replacing QuantizeLinear output `q_output`.
pub fn folded_weight_name(graph: &Graph, q_output: &str) -> String {
    graph.fresh_name(&format!("{q_output}_folded"))
}

/// Canonical names for the elements that replace one float bias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiasFoldNames {
    pub quantized_name: String,
    pub scale_name: String,
    pub zp_name: String,
    pub node_name: String,
    /// Float output wired into the consumer's bias slot.
    pub output_name: String,
}

impl BiasFoldNames {
    /// Derive all names from the bias initializer name, avoiding anything
    /// already present in `graph`.
    pub fn for_bias(graph: &Graph, bias: &str) -> Self {
        Self {
            quantized_name: graph.fresh_name(&format!("{bias}_folded")),
            scale_name: graph.fresh_name(&format!("{bias}_scales")),
            zp_name: graph.fresh_name(&format!("{bias}_zero_points")),
            node_name: graph.fresh_name(&format!("DequantizeLinear_{bias}")),
            output_name: graph.fresh_name(&format!("{bias}_dq")),
        }
    }
}

/// Build the bias DequantizeLinear node. `axis` is set only for
/// per-channel scales.
pub fn build_dequantize_node(names: &BiasFoldNames, axis: Option<i64>) -> Node {
    let mut node = Node::new(
        names.node_name.clone(),
        OpKind::DequantizeLinear,
        vec![
            names.quantized_name.clone(),
            names.scale_name.clone(),
            names.zp_name.clone(),
        ],
        vec![names.output_name.clone()],
    );
    if let Some(a) = axis {
        node.attributes.set_int("axis", a);
    }
    node
}

/// Rank-0 for a single scale, rank-1 `[n]` otherwise.
fn param_dims(len: usize) -> Vec<i64> {
    if len == 1 {
        Vec::new()
    } else {
        vec![len as i64]
    }
}

pub fn build_scale_constant(names: &BiasFoldNames, scales: &[f32]) -> Constant {
    Constant::new(
        names.scale_name.clone(),
        param_dims(scales.len()),
        TensorData::Float(scales.to_vec()),
    )
}

pub fn build_zero_point_constant(names: &BiasFoldNames, len: usize) -> Constant {
    Constant::new(names.zp_name.clone(), param_dims(len), TensorData::Int32(vec![0; len]))
}
