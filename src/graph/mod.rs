//! In-memory graph the folding pass mutates.
//!
//! A [`Graph`] is lifted from an ONNX `GraphProto`, edited in place, and
//! lowered back. Nodes, constants and variables are explicit types; graph
//! inputs and outputs are kept as their original `ValueInfoProto`s so they
//! round-trip exactly.

pub mod cleanup;
mod node;
mod tensor;

pub use node::{Attributes, Node, OpKind};
pub use tensor::{Constant, ElementType, TensorData};

use crate::errors::Result;
use crate::onnx_proto::{
    tensor_shape_proto, type_proto, GraphProto, TensorShapeProto, TypeProto, ValueInfoProto,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A typed, shaped tensor produced by exactly one node. Carries no data.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub elem_type: ElementType,
    pub dims: Vec<i64>,
}

impl Variable {
    pub fn new(name: impl Into<String>, elem_type: ElementType, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            elem_type,
            dims,
        }
    }

    pub fn to_value_info(&self) -> ValueInfoProto {
        let dim = self
            .dims
            .iter()
            .map(|&d| tensor_shape_proto::Dimension {
                value: Some(tensor_shape_proto::dimension::Value::DimValue(d)),
                denotation: String::new(),
            })
            .collect();

        ValueInfoProto {
            name: self.name.clone(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: self.elem_type.onnx_code(),
                    shape: Some(TensorShapeProto { dim }),
                })),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    /// Nodes in serialization order.
    pub nodes: Vec<Node>,
    /// Initializers, in their original order.
    pub constants: Vec<Constant>,
    pub inputs: Vec<ValueInfoProto>,
    pub outputs: Vec<ValueInfoProto>,
    pub value_info: Vec<ValueInfoProto>,
    /// Initializers held as int8 storage that must be written as packed INT4.
    pub int4_initializers: BTreeSet<String>,
    /// Fields the pass never touches (doc string, sparse initializers,
    /// quantization annotations, metadata).
    pub(crate) passthrough: GraphProto,
}

impl Graph {
    pub fn from_proto(proto: GraphProto) -> Result<Self> {
        let GraphProto {
            node,
            name,
            initializer,
            sparse_initializer,
            doc_string,
            input,
            output,
            value_info,
            quantization_annotation,
            metadata_props,
        } = proto;

        let mut constants = Vec::with_capacity(initializer.len());
        let mut int4_initializers = BTreeSet::new();
        for tensor in initializer {
            let (constant, is_int4) = Constant::from_proto(tensor)?;
            if is_int4 {
                int4_initializers.insert(constant.name.clone());
            }
            constants.push(constant);
        }

        let nodes = node
            .into_iter()
            .map(Node::from_proto)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            nodes,
            constants,
            inputs: input,
            outputs: output,
            value_info,
            int4_initializers,
            passthrough: GraphProto {
                sparse_initializer,
                doc_string,
                quantization_annotation,
                metadata_props,
                ..Default::default()
            },
        })
    }

    /// Lower to a `GraphProto`. INT4 initializers are still int8 here; see
    /// `onnx_utils::repack_int4_initializers` for the packing pass.
    pub fn to_proto(&self) -> GraphProto {
        GraphProto {
            node: self.nodes.iter().map(Node::to_proto).collect(),
            name: self.name.clone(),
            initializer: self.constants.iter().map(Constant::to_proto).collect(),
            input: self.inputs.clone(),
            output: self.outputs.clone(),
            value_info: self.value_info.clone(),
            ..self.passthrough.clone()
        }
    }

    pub fn constant(&self, name: &str) -> Option<&Constant> {
        self.constants.iter().find(|c| c.name == name)
    }

    /// Output tensor name → index of the producing node.
    pub fn producers(&self) -> HashMap<&str, usize> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(i, node)| {
                node.outputs
                    .iter()
                    .filter(|o| !o.is_empty())
                    .map(move |o| (o.as_str(), i))
            })
            .collect()
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.name.as_str())
    }

    /// `base` if no tensor or node already uses it, otherwise `base_1`,
    /// `base_2`, ...
    pub fn fresh_name(&self, base: &str) -> String {
        let taken: HashSet<&str> = self
            .constants
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.inputs.iter().map(|i| i.name.as_str()))
            .chain(self.nodes.iter().flat_map(|n| {
                std::iter::once(n.name.as_str()).chain(n.outputs.iter().map(String::as_str))
            }))
            .collect();

        if !taken.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_else(|| base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_proto::{tensor_proto, NodeProto, TensorProto};

    fn make_graph() -> GraphProto {
        GraphProto {
            name: "g".into(),
            doc_string: "kept".into(),
            input: vec![ValueInfoProto {
                name: "x".into(),
                ..Default::default()
            }],
            output: vec![ValueInfoProto {
                name: "y".into(),
                ..Default::default()
            }],
            initializer: vec![TensorProto {
                name: "w".into(),
                dims: vec![2],
                data_type: tensor_proto::DataType::Float as i32,
                float_data: vec![1.0, 2.0],
                ..Default::default()
            }],
            node: vec![NodeProto {
                name: "mul0".into(),
                op_type: "Mul".into(),
                input: vec!["x".into(), "w".into()],
                output: vec!["y".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_lift_and_lower_preserves_structure() {
        let graph = Graph::from_proto(make_graph()).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].op, OpKind::Other("Mul".into()));
        assert!(graph.constant("w").is_some());

        let proto = graph.to_proto();
        assert_eq!(proto.name, "g");
        assert_eq!(proto.doc_string, "kept");
        assert_eq!(proto.node[0].op_type, "Mul");
        assert_eq!(proto.initializer[0].raw_data.len(), 8);
    }

    #[test]
    fn test_producers_map() {
        let graph = Graph::from_proto(make_graph()).unwrap();
        let producers = graph.producers();
        assert_eq!(producers.get("y"), Some(&0));
        assert_eq!(producers.get("w"), None);
    }

    #[test]
    fn test_fresh_name_avoids_collisions() {
        let graph = Graph::from_proto(make_graph()).unwrap();
        assert_eq!(graph.fresh_name("bias"), "bias");
        assert_eq!(graph.fresh_name("w"), "w_1");
        assert_eq!(graph.fresh_name("mul0"), "mul0_1");
    }

    #[test]
    fn test_variable_value_info() {
        let info = Variable::new("b_dq", ElementType::Float, vec![4]).to_value_info();
        assert_eq!(info.name, "b_dq");
        let Some(TypeProto {
            value: Some(type_proto::Value::TensorType(tensor)),
            ..
        }) = info.r#type
        else {
            panic!("expected a tensor type");
        };
        assert_eq!(tensor.elem_type, tensor_proto::DataType::Float as i32);
        assert_eq!(tensor.shape.unwrap().dim.len(), 1);
    }
}
