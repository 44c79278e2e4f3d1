//! Proto-level passes run after the folded graph has been lowered: INT4
//! repacking, the connectivity check, and the opset bump INT4 requires.

use crate::errors::{FoldError, Result};
use crate::onnx_proto::{tensor_proto, GraphProto, ModelProto, OperatorSetIdProto};
use crate::quantization::pack_int4;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;

/// Minimum default-domain opset that accepts INT4 tensors.
pub const INT4_MIN_OPSET: i64 = 21;

/// Node inputs that name no value defined before the node.
#[derive(Debug)]
#[must_use]
pub struct ConnectivityReport {
    pub valid: bool,
    /// One line per unresolved input, in node order.
    pub broken_refs: Vec<String>,
}

impl ConnectivityReport {
    fn from_broken(broken_refs: Vec<String>) -> Self {
        Self {
            valid: broken_refs.is_empty(),
            broken_refs,
        }
    }

    /// Indented text block for the CLI `check` command.
    pub fn summary(&self) -> String {
        if self.valid {
            return "  Graph connectivity: OK\n".to_string();
        }
        let count = self.broken_refs.len();
        let mut out = format!(
            "  Graph connectivity: BROKEN ({count} dangling reference{})\n",
            if count == 1 { "" } else { "s" }
        );
        for (i, line) in self.broken_refs.iter().enumerate() {
            let _ = writeln!(out, "    {}. {line}", i + 1);
        }
        out
    }
}

/// Names that exist before the first node runs: graph inputs, dense
/// initializers and the values of sparse initializers.
fn graph_level_names(graph: &GraphProto) -> HashSet<&str> {
    let inputs = graph.input.iter().map(|v| v.name.as_str());
    let dense = graph.initializer.iter().map(|t| t.name.as_str());
    let sparse = graph
        .sparse_initializer
        .iter()
        .filter_map(|s| s.values.as_ref())
        .map(|t| t.name.as_str());
    inputs.chain(dense).chain(sparse).collect()
}

/// Check that every node input is defined by the graph or by an earlier
/// node, the order ONNX Runtime requires on load.
pub fn validate_graph_connectivity(graph: &GraphProto) -> ConnectivityReport {
    let mut defined = graph_level_names(graph);
    let mut broken = Vec::new();

    for node in &graph.node {
        let unresolved = node
            .input
            .iter()
            .filter(|name| !name.is_empty() && !defined.contains(name.as_str()));
        for name in unresolved {
            broken.push(format!(
                "Node '{}' (op={}) → unknown input '{}'",
                node.name, node.op_type, name
            ));
        }
        defined.extend(node.output.iter().map(String::as_str).filter(|n| !n.is_empty()));
    }

    ConnectivityReport::from_broken(broken)
}

/// Raise the default-domain opset (`""` or `"ai.onnx"`) to at least
/// `min_version`, adding the entry when the model declares none.
pub fn ensure_opset_version(model: &mut ModelProto, min_version: i64) {
    let default_domain = model
        .opset_import
        .iter_mut()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx");

    match default_domain {
        Some(opset) if opset.version < min_version => {
            tracing::debug!("raising opset from {} to {}", opset.version, min_version);
            opset.version = min_version;
        }
        Some(_) => {}
        None => model.opset_import.push(OperatorSetIdProto {
            domain: String::new(),
            version: min_version,
        }),
    }
}

/// Rewrite every initializer named in `int4` from int8 storage to packed
/// INT4: data type becomes INT4 and `raw_data` the nibble-packed bytes.
///
/// Returns the number of initializers rewritten. Names with no matching
/// initializer are ignored; a named initializer that is not int8 is an
/// error.
pub fn repack_int4_initializers(graph: &mut GraphProto, int4: &BTreeSet<String>) -> Result<usize> {
    let mut repacked = 0;

    for init in graph.initializer.iter_mut() {
        if !int4.contains(&init.name) {
            continue;
        }
        if init.data_type != tensor_proto::DataType::Int8 as i32 {
            return Err(FoldError::InvalidTensor {
                name: init.name.clone(),
                reason: format!(
                    "INT4 initializer must be held as int8 before packing, found data type {}",
                    init.data_type
                ),
            });
        }

        let values: Vec<i8> = if init.raw_data.is_empty() {
            init.int32_data.iter().map(|&v| v as i8).collect()
        } else {
            init.raw_data.iter().map(|&b| b as i8).collect()
        };

        init.data_type = tensor_proto::DataType::Int4 as i32;
        init.raw_data = pack_int4(&values);
        init.int32_data.clear();
        repacked += 1;
    }

    Ok(repacked)
}
