//! Dead-node elimination and topological ordering.
//!
//! Rewrites leave the superseded QuantizeLinear nodes and float constants
//! dangling, and append new nodes at the end of the list. ONNX requires the
//! node list in topological order, so every rewrite pass ends with
//! [`cleanup`].

use super::Graph;
use crate::errors::{FoldError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashSet;

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_nodes: usize,
    pub removed_constants: usize,
}

/// Remove dead nodes and constants, then sort the node list.
pub fn cleanup(graph: &mut Graph) -> Result<CleanupStats> {
    let stats = remove_dead_nodes(graph);
    sort_topologically(graph)?;
    Ok(stats)
}

/// Drop every node and constant that no graph output depends on.
///
/// Graph inputs that double as a removed initializer are dropped too;
/// otherwise the runtime would expect them as feeds.
pub fn remove_dead_nodes(graph: &mut Graph) -> CleanupStats {
    let producers = graph.producers();

    let mut live_nodes = vec![false; graph.nodes.len()];
    let mut needed: HashSet<String> = HashSet::new();
    let mut worklist: Vec<&str> = graph.output_names().collect();

    while let Some(name) = worklist.pop() {
        if !needed.insert(name.to_string()) {
            continue;
        }
        if let Some(&idx) = producers.get(name) {
            if !live_nodes[idx] {
                live_nodes[idx] = true;
                worklist.extend(graph.nodes[idx].referenced_names());
            }
        }
    }

    let node_count = graph.nodes.len();
    let mut idx = 0;
    graph.nodes.retain(|_| {
        let keep = live_nodes[idx];
        idx += 1;
        keep
    });

    let mut removed: HashSet<String> = HashSet::new();
    graph.constants.retain(|c| {
        let keep = needed.contains(&c.name);
        if !keep {
            removed.insert(c.name.clone());
        }
        keep
    });
    graph.inputs.retain(|i| !removed.contains(&i.name));
    graph.int4_initializers.retain(|n| !removed.contains(n));

    let produced: HashSet<&str> = graph
        .nodes
        .iter()
        .flat_map(|n| n.outputs.iter().map(String::as_str))
        .collect();
    graph.value_info.retain(|v| produced.contains(v.name.as_str()));

    CleanupStats {
        removed_nodes: node_count - graph.nodes.len(),
        removed_constants: removed.len(),
    }
}

/// Reorder `graph.nodes` so every producer precedes its consumers.
///
/// A node list that is already in order is left as is.
pub fn sort_topologically(graph: &mut Graph) -> Result<()> {
    let producers = graph.producers();

    let in_order = graph.nodes.iter().enumerate().all(|(consumer, node)| {
        node.referenced_names()
            .into_iter()
            .all(|name| producers.get(name).map_or(true, |&producer| producer < consumer))
    });
    if in_order {
        return Ok(());
    }

    let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(graph.nodes.len(), 0);
    let indices: Vec<NodeIndex> = (0..graph.nodes.len()).map(|i| dag.add_node(i)).collect();

    for (consumer, node) in graph.nodes.iter().enumerate() {
        for name in node.referenced_names() {
            if let Some(&producer) = producers.get(name) {
                dag.add_edge(indices[producer], indices[consumer], ());
            }
        }
    }

    let order = toposort(&dag, None).map_err(|cycle| {
        let node = &graph.nodes[dag[cycle.node_id()]];
        FoldError::graph(format!(
            "graph contains a cycle through node '{}' ({})",
            node.name,
            node.op.as_str()
        ))
    })?;

    let mut slots: Vec<_> = std::mem::take(&mut graph.nodes).into_iter().map(Some).collect();
    graph.nodes = order
        .into_iter()
        .filter_map(|ix| slots[dag[ix]].take())
        .collect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Constant, Node, OpKind, TensorData};
    use crate::onnx_proto::ValueInfoProto;

    fn value(name: &str) -> ValueInfoProto {
        ValueInfoProto {
            name: name.into(),
            ..Default::default()
        }
    }

    fn node(name: &str, inputs: &[&str], outputs: &[&str]) -> Node {
        Node::new(
            name,
            OpKind::Other("Relu".into()),
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_dangling_branch_is_removed() {
        let mut graph = Graph {
            inputs: vec![value("x"), value("stale")],
            outputs: vec![value("y")],
            constants: vec![
                Constant::new("used", vec![1], TensorData::Float(vec![1.0])),
                Constant::new("stale", vec![1], TensorData::Float(vec![2.0])),
            ],
            nodes: vec![
                node("a", &["x", "used"], &["y"]),
                node("dead", &["stale"], &["z"]),
            ],
            value_info: vec![value("z")],
            ..Default::default()
        };

        let stats = remove_dead_nodes(&mut graph);
        assert_eq!(stats.removed_nodes, 1);
        assert_eq!(stats.removed_constants, 1);
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.constant("stale").is_none());
        assert!(graph.inputs.iter().all(|i| i.name != "stale"));
        assert!(graph.value_info.is_empty());
    }

    #[test]
    fn test_appended_node_is_moved_before_consumer() {
        let mut graph = Graph {
            inputs: vec![value("x")],
            outputs: vec![value("y")],
            nodes: vec![node("b", &["mid"], &["y"]), node("a", &["x"], &["mid"])],
            ..Default::default()
        };

        sort_topologically(&mut graph).unwrap();
        let order: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_sorted_order_is_kept() {
        // independent branches: any order is valid, the existing one stays
        let mut graph = Graph {
            inputs: vec![value("x")],
            outputs: vec![value("y"), value("z")],
            nodes: vec![node("second", &["x"], &["z"]), node("first", &["x"], &["y"])],
            ..Default::default()
        };
        sort_topologically(&mut graph).unwrap();
        assert_eq!(graph.nodes[0].name, "second");
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut graph = Graph {
            outputs: vec![value("p")],
            nodes: vec![node("n1", &["q"], &["p"]), node("n2", &["p"], &["q"])],
            ..Default::default()
        };
        let err = sort_topologically(&mut graph).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
