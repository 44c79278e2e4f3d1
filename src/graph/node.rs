//! Operator nodes and their attributes.

use crate::errors::{FoldError, Result};
use crate::onnx_proto::{
    attribute_proto::AttributeType, AttributeProto, GraphProto, NodeProto, StringStringEntryProto,
};

/// Operator kinds the folding pass reasons about. Everything else is carried
/// opaquely under [`OpKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    QuantizeLinear,
    DequantizeLinear,
    Gemm,
    Conv,
    ConvTranspose,
    Other(String),
}

impl OpKind {
    /// Map an ONNX `(domain, op_type)` pair. Operators from non-default
    /// domains (e.g. `com.microsoft`) are always [`OpKind::Other`].
    pub fn parse(domain: &str, op_type: &str) -> Self {
        if !(domain.is_empty() || domain == "ai.onnx") {
            return OpKind::Other(op_type.to_string());
        }
        match op_type {
            "QuantizeLinear" => OpKind::QuantizeLinear,
            "DequantizeLinear" => OpKind::DequantizeLinear,
            "Gemm" => OpKind::Gemm,
            "Conv" => OpKind::Conv,
            "ConvTranspose" => OpKind::ConvTranspose,
            other => OpKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OpKind::QuantizeLinear => "QuantizeLinear",
            OpKind::DequantizeLinear => "DequantizeLinear",
            OpKind::Gemm => "Gemm",
            OpKind::Conv => "Conv",
            OpKind::ConvTranspose => "ConvTranspose",
            OpKind::Other(op) => op,
        }
    }

    /// Linear/convolution kernels whose third input is an accumulator-width bias.
    pub fn takes_bias(&self) -> bool {
        matches!(self, OpKind::Gemm | OpKind::Conv | OpKind::ConvTranspose)
    }
}

/// Typed view over a node's attribute list. Order is preserved so that
/// unrelated attributes round-trip unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Vec<AttributeProto>);

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&AttributeProto> {
        self.0.iter().find(|a| a.name == name)
    }

    /// Integer attribute lookup. A present attribute of another type is an
    /// error rather than a silent default.
    pub fn int(&self, name: &str) -> Result<Option<i64>> {
        let Some(attr) = self.get(name) else {
            return Ok(None);
        };
        match attr.r#type() {
            AttributeType::Int => Ok(Some(attr.i)),
            // Pre-IR3 producers leave `type` unset.
            AttributeType::Undefined if attr.ints.is_empty() && attr.floats.is_empty() => {
                Ok(Some(attr.i))
            }
            other => Err(FoldError::graph(format!(
                "attribute '{name}' must be INT, found {}",
                other.as_str_name()
            ))),
        }
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        let attr = AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Int as i32,
            i: value,
            ..Default::default()
        };
        match self.0.iter_mut().find(|a| a.name == name) {
            Some(slot) => *slot = attr,
            None => self.0.push(attr),
        }
    }

    /// Subgraph bodies (`If`, `Loop`, `Scan`, ...).
    pub fn subgraphs(&self) -> impl Iterator<Item = &GraphProto> {
        self.0
            .iter()
            .flat_map(|a| a.g.iter().chain(a.graphs.iter()))
    }

    pub fn into_protos(self) -> Vec<AttributeProto> {
        self.0
    }
}

impl From<Vec<AttributeProto>> for Attributes {
    fn from(attrs: Vec<AttributeProto>) -> Self {
        Attributes(attrs)
    }
}

/// One operator in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub domain: String,
    /// Input tensor names; an empty string marks an omitted optional input.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Attributes,
    doc_string: String,
    overload: String,
    metadata_props: Vec<StringStringEntryProto>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op: OpKind,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op,
            domain: String::new(),
            inputs,
            outputs,
            attributes: Attributes::default(),
            doc_string: String::new(),
            overload: String::new(),
            metadata_props: Vec::new(),
        }
    }

    /// Lift a `NodeProto`, validating the attributes the folding pass reads.
    pub fn from_proto(proto: NodeProto) -> Result<Self> {
        let op = OpKind::parse(&proto.domain, &proto.op_type);
        let attributes = Attributes::from(proto.attribute);

        if matches!(op, OpKind::QuantizeLinear | OpKind::DequantizeLinear) {
            attributes.int("axis").map_err(|e| {
                FoldError::graph(format!("node '{}' ({}): {e}", proto.name, op.as_str()))
            })?;
        }

        Ok(Self {
            name: proto.name,
            op,
            domain: proto.domain,
            inputs: proto.input,
            outputs: proto.output,
            attributes,
            doc_string: proto.doc_string,
            overload: proto.overload,
            metadata_props: proto.metadata_props,
        })
    }

    pub fn to_proto(&self) -> NodeProto {
        NodeProto {
            name: self.name.clone(),
            op_type: self.op.as_str().to_string(),
            domain: self.domain.clone(),
            input: self.inputs.clone(),
            output: self.outputs.clone(),
            attribute: self.attributes.clone().into_protos(),
            doc_string: self.doc_string.clone(),
            overload: self.overload.clone(),
            metadata_props: self.metadata_props.clone(),
        }
    }

    /// Input at `slot`, treating the empty name as absent.
    pub fn input(&self, slot: usize) -> Option<&str> {
        self.inputs
            .get(slot)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Names read by the node: explicit inputs plus outer-scope names
    /// referenced from subgraph bodies.
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .inputs
            .iter()
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .collect();
        for body in self.attributes.subgraphs() {
            collect_subgraph_inputs(body, &mut names);
        }
        names
    }
}

fn collect_subgraph_inputs<'a>(graph: &'a GraphProto, names: &mut Vec<&'a str>) {
    for node in &graph.node {
        names.extend(node.input.iter().map(String::as_str).filter(|n| !n.is_empty()));
        for attr in &node.attribute {
            for body in attr.g.iter().chain(attr.graphs.iter()) {
                collect_subgraph_inputs(body, names);
            }
        }
    }
}
