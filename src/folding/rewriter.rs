//! Apply matched folds to the in-memory graph.
//!
//! Every edit here appends constants or nodes and rewires inputs by name;
//! node indices recorded in [`FoldSite`]s stay valid for the whole pass.
//! Superseded QuantizeLinear nodes and float constants are left dangling
//! for [`crate::graph::cleanup`] to collect.

use super::matcher::{BiasLeg, FoldSite};
use super::quantization_nodes::{
    build_dequantize_node, build_scale_constant, build_zero_point_constant, folded_weight_name,
    BiasFoldNames,
};
use super::FoldReport;
use crate::errors::{FoldError, Result};
use crate::graph::{Constant, ElementType, Graph, Node, Variable};
use crate::quantization::{
    derive_bias_params, quantize_tensor, ClipWarning, QuantParams, QuantTarget,
};
use std::collections::{HashMap, HashSet};

/// ONNX default for the `axis` attribute of QuantizeLinear/DequantizeLinear.
const DEFAULT_QDQ_AXIS: i64 = 1;

/// Fold every site into `graph`.
///
/// Each QuantizeLinear is quantized once even when several sites reach it;
/// each consumer gets at most one bias fold. `removed_nodes` in the returned
/// report is left at zero, cleanup fills it in.
pub fn apply_folds(graph: &mut Graph, sites: &[FoldSite]) -> Result<FoldReport> {
    let mut report = FoldReport::default();
    let mut folded: HashMap<usize, String> = HashMap::new();
    let mut biased: HashSet<usize> = HashSet::new();

    for site in sites {
        let folded_name = match folded.get(&site.quantize) {
            Some(name) => name.clone(),
            None => {
                let name = fold_weight(graph, site, &mut report)?;
                folded.insert(site.quantize, name.clone());
                name
            }
        };
        graph.nodes[site.dequantize].inputs[0] = folded_name;

        if let Some(leg) = &site.bias {
            if biased.insert(site.consumer) {
                fold_bias(graph, site, leg, &mut report)?;
            }
        }
    }

    Ok(report)
}

fn required_input<'n>(node: &'n Node, slot: usize, what: &str) -> Result<&'n str> {
    node.input(slot).ok_or_else(|| {
        FoldError::graph(format!(
            "{} '{}' has no {what} input",
            node.op.as_str(),
            node.name
        ))
    })
}

fn constant_input<'g>(
    graph: &'g Graph,
    node: &Node,
    slot: usize,
    what: &str,
) -> Result<&'g Constant> {
    let name = required_input(node, slot, what)?;
    graph.constant(name).ok_or_else(|| {
        FoldError::graph(format!(
            "{} '{}' has a non-constant {what} '{name}'",
            node.op.as_str(),
            node.name
        ))
    })
}

fn target_for_zero_point(graph: &Graph, zp: &Constant) -> Result<QuantTarget> {
    if graph.int4_initializers.contains(&zp.name) {
        return Ok(QuantTarget::Int4);
    }
    match zp.element_type() {
        Some(ElementType::Int8) => Ok(QuantTarget::Int8),
        Some(ElementType::Uint8) => Ok(QuantTarget::Uint8),
        Some(ElementType::Int32) => Ok(QuantTarget::Int32),
        _ => Err(FoldError::InvalidTensor {
            name: zp.name.clone(),
            reason: "unsupported zero-point element type".into(),
        }),
    }
}

/// Destination type: the DequantizeLinear zero-point type, else the
/// QuantizeLinear one, else uint8.
fn resolve_target(
    graph: &Graph,
    dq: &Node,
    q_zero_point: Option<&Constant>,
) -> Result<QuantTarget> {
    let dq_zero_point = dq.input(2).and_then(|name| graph.constant(name));
    match dq_zero_point.or(q_zero_point) {
        Some(zp) => target_for_zero_point(graph, zp),
        None => Ok(QuantTarget::Uint8),
    }
}

fn report_warnings(report: &mut FoldReport, warnings: Vec<ClipWarning>, node: &str) {
    for mut warning in warnings {
        warning.node = node.to_string();
        tracing::warn!("{}", warning);
        report.warnings.push(warning);
    }
}

fn fold_weight(graph: &mut Graph, site: &FoldSite, report: &mut FoldReport) -> Result<String> {
    let q = &graph.nodes[site.quantize];
    let dq = &graph.nodes[site.dequantize];
    let consumer_name = graph.nodes[site.consumer].name.clone();

    let scale = constant_input(graph, q, 1, "scale")?.as_f32()?.to_vec();
    let q_zero_point = match q.input(2) {
        Some(_) => Some(constant_input(graph, q, 2, "zero-point")?),
        None => None,
    };
    let zero_point = match q_zero_point {
        Some(zp) => zp.to_i64_vec()?,
        None => vec![0],
    };
    let target = resolve_target(graph, dq, q_zero_point)?;

    let mut params = QuantParams {
        scale,
        zero_point,
        axis: 0,
    };
    if params.is_per_channel() {
        params.axis = dq.attributes.int("axis")?.unwrap_or(DEFAULT_QDQ_AXIS);
    }

    let q_output = q.outputs.first().filter(|o| !o.is_empty()).ok_or_else(|| {
        FoldError::graph(format!("QuantizeLinear '{}' has no output", q.name))
    })?;
    let folded_name = folded_weight_name(graph, q_output);

    let source = graph.constant(&site.source).ok_or_else(|| {
        FoldError::graph(format!("constant '{}' disappeared during folding", site.source))
    })?;
    let dims = source.dims.clone();
    let quantized = quantize_tensor(
        &site.source,
        source.as_f32()?,
        &source.shape()?,
        &params,
        target,
    )?;

    report_warnings(report, quantized.diagnostics, &consumer_name);
    graph
        .constants
        .push(Constant::new(folded_name.clone(), dims, target.to_tensor_data(&quantized.codes)));
    if target == QuantTarget::Int4 {
        graph.int4_initializers.insert(folded_name.clone());
    }

    report.folded_weights += 1;
    tracing::info!("Applied quantization for node {}", consumer_name);
    Ok(folded_name)
}

fn fold_bias(
    graph: &mut Graph,
    site: &FoldSite,
    leg: &BiasLeg,
    report: &mut FoldReport,
) -> Result<()> {
    let consumer_name = graph.nodes[site.consumer].name.clone();
    let input_dq = &graph.nodes[leg.input_dequantize];
    let weight_dq = &graph.nodes[site.dequantize];

    let scales = input_dq
        .input(1)
        .and_then(|n| graph.constant(n))
        .zip(weight_dq.input(1).and_then(|n| graph.constant(n)));
    let Some((input_scale, weight_scale)) = scales else {
        tracing::debug!(
            "skipping bias '{}' of node {}: activation or weight scale is not a constant",
            leg.bias,
            consumer_name
        );
        return Ok(());
    };

    let params = derive_bias_params(&leg.bias, input_scale.as_f32()?, weight_scale.as_f32()?)?;

    let bias = graph.constant(&leg.bias).ok_or_else(|| {
        FoldError::graph(format!("bias '{}' disappeared during folding", leg.bias))
    })?;
    let dims = bias.dims.clone();
    let quantized = quantize_tensor(
        &leg.bias,
        bias.as_f32()?,
        &bias.shape()?,
        &params,
        QuantTarget::Int32,
    )?;
    report_warnings(report, quantized.diagnostics, &consumer_name);

    let names = BiasFoldNames::for_bias(graph, &leg.bias);
    let axis = params.is_per_channel().then_some(0);

    graph.constants.push(Constant::new(
        names.quantized_name.clone(),
        dims.clone(),
        QuantTarget::Int32.to_tensor_data(&quantized.codes),
    ));
    graph.constants.push(build_scale_constant(&names, &params.scale));
    graph
        .constants
        .push(build_zero_point_constant(&names, params.zero_point.len()));
    graph.nodes.push(build_dequantize_node(&names, axis));
    graph
        .value_info
        .push(Variable::new(names.output_name.clone(), ElementType::Float, dims).to_value_info());
    graph.nodes[site.consumer].inputs[2] = names.output_name;

    report.folded_biases += 1;
    tracing::info!("Applied bias quantization for node {}", consumer_name);
    Ok(())
}
