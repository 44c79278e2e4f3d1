//! Find constant-weight QDQ motifs.
//!
//! A foldable site is a float32 constant feeding `QuantizeLinear`, whose
//! output feeds `DequantizeLinear`, whose output feeds some consumer. A
//! QuantizeLinear whose data input is a runtime tensor (an activation) is
//! real quantization and is never matched.

use crate::graph::{ElementType, Graph, Node, OpKind};
use std::collections::{HashMap, HashSet};

/// One consumer input reached through a foldable QDQ chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSite {
    /// Index of the consuming node in `graph.nodes`.
    pub consumer: usize,
    /// Consumer input slot fed by the DequantizeLinear.
    pub slot: usize,
    pub dequantize: usize,
    pub quantize: usize,
    /// Float constant feeding the QuantizeLinear.
    pub source: String,
    pub bias: Option<BiasLeg>,
}

/// Float bias of a Gemm/Conv/ConvTranspose whose activation input is
/// itself dequantized, so the bias scale can be derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiasLeg {
    pub bias: String,
    /// DequantizeLinear feeding the consumer's data input (slot 0).
    pub input_dequantize: usize,
}

/// Every foldable reference in `graph`, in node order.
///
/// A constant shared by several consumers yields one site per reference;
/// the rewriter folds each QuantizeLinear only once.
pub fn find_fold_sites(graph: &Graph) -> Vec<FoldSite> {
    let producers = graph.producers();
    let float_constants: HashSet<&str> = graph
        .constants
        .iter()
        .filter(|c| c.element_type() == Some(ElementType::Float))
        .map(|c| c.name.as_str())
        .collect();

    let mut sites = Vec::new();
    for (consumer, node) in graph.nodes.iter().enumerate() {
        for (slot, input) in node.inputs.iter().enumerate() {
            let Some((dequantize, quantize, source)) =
                match_qdq_chain(graph, &producers, &float_constants, input)
            else {
                continue;
            };

            let bias = if slot == 1 {
                match_bias_leg(graph, &producers, &float_constants, node)
            } else {
                None
            };

            sites.push(FoldSite {
                consumer,
                slot,
                dequantize,
                quantize,
                source: source.to_string(),
                bias,
            });
        }
    }
    sites
}

fn match_qdq_chain<'g>(
    graph: &'g Graph,
    producers: &HashMap<&str, usize>,
    float_constants: &HashSet<&str>,
    input: &str,
) -> Option<(usize, usize, &'g str)> {
    let &dequantize = producers.get(input)?;
    let dq = &graph.nodes[dequantize];
    if dq.op != OpKind::DequantizeLinear {
        return None;
    }

    let &quantize = producers.get(dq.input(0)?)?;
    let q = &graph.nodes[quantize];
    if q.op != OpKind::QuantizeLinear {
        return None;
    }

    let source = q.input(0)?;
    float_constants
        .contains(source)
        .then_some((dequantize, quantize, source))
}

fn match_bias_leg(
    graph: &Graph,
    producers: &HashMap<&str, usize>,
    float_constants: &HashSet<&str>,
    node: &Node,
) -> Option<BiasLeg> {
    if !node.op.takes_bias() || node.inputs.len() != 3 {
        return None;
    }

    let &input_dequantize = producers.get(node.input(0)?)?;
    let input_dq = &graph.nodes[input_dequantize];
    if input_dq.op != OpKind::DequantizeLinear || input_dq.inputs.len() <= 2 {
        return None;
    }

    let bias = node.input(2)?;
    float_constants.contains(bias).then(|| BiasLeg {
        bias: bias.to_string(),
        input_dequantize,
    })
}
