//! Property-based tests for quantization correctness.
//!
//! Four property families are verified:
//!
//! 1. **Clamp safety**: every code returned by `quantize_tensor` lies in the
//!    target range for any finite input, and a clip diagnostic is raised
//!    exactly when some unclipped code fell outside it.
//!
//! 2. **Round-trip accuracy**: for values whose codes do not clip,
//!    `|dequantize(quantize(v)) - v| <= scale`, per tensor and per channel.
//!
//! 3. **Pack / unpack identity**: `unpack_int4(pack_int4(data), len) == data`
//!    for any slice of valid INT4 values, and the packed size is always
//!    `ceil(len / 2)`.
//!
//! 4. **Fold idempotence**: folding a random QDQ weight chain twice finds
//!    nothing to do the second time.

use proptest::prelude::*;
use qdq_fold::graph::{Constant, Graph, Node, OpKind, TensorData};
use qdq_fold::onnx_proto::ValueInfoProto;
use qdq_fold::quantization::{dequantize_tensor, quantize_tensor, QuantParams, QuantTarget};
use qdq_fold::{fold_graph, pack_int4, unpack_int4};

// ---------------------------------------------------------------------------
// Shared strategies
// ---------------------------------------------------------------------------

fn target() -> impl Strategy<Value = QuantTarget> {
    prop_oneof![
        Just(QuantTarget::Int8),
        Just(QuantTarget::Uint8),
        Just(QuantTarget::Int32),
        Just(QuantTarget::Int4),
    ]
}

/// An `i8` value in the valid INT4 domain `[-8, 7]`.
fn int4_value() -> impl Strategy<Value = i8> {
    -8_i8..=7_i8
}

fn int4_vec() -> impl Strategy<Value = Vec<i8>> {
    prop::collection::vec(int4_value(), 0..=512)
}

/// A non-empty `Vec<f32>` with finite values in a moderate range.
fn finite_f32_vec() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1e6_f32..=1e6_f32, 1..=512)
}

fn scale() -> impl Strategy<Value = f32> {
    1e-4_f32..=10.0_f32
}

// ---------------------------------------------------------------------------
// Property 1: Clamp safety
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_codes_always_in_range(
        data in finite_f32_vec(),
        s in scale(),
        zp in -8_i64..=7_i64,
        t in target(),
    ) {
        let zp = if t == QuantTarget::Uint8 { zp + 8 } else { zp };
        let params = QuantParams::per_tensor(s, zp);
        let q = quantize_tensor("w", &data, &[data.len()], &params, t).unwrap();

        let (lo, hi) = t.range();
        prop_assert_eq!(q.codes.len(), data.len());
        prop_assert!(q.codes.iter().all(|&c| (lo..=hi).contains(&c)));
        prop_assert!(q.diagnostics.len() <= 1);

        let clipped = q.codes.iter().any(|&c| c == lo || c == hi);
        if !q.diagnostics.is_empty() {
            prop_assert!(clipped);
        }
    }
}

// ---------------------------------------------------------------------------
// Property 2: Round-trip accuracy
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_round_trip_error_bounded(
        codes in prop::collection::vec(-100_i32..=100, 1..=256),
        noise in prop::collection::vec(-0.49_f32..=0.49, 256),
        s in 1e-3_f32..=1.0,
    ) {
        // Values built as (code + noise) * s never clip in int8
        let values: Vec<f32> = codes
            .iter()
            .zip(&noise)
            .map(|(&c, &n)| (c as f32 + n) * s)
            .collect();
        let params = QuantParams::per_tensor(s, 0);
        let q = quantize_tensor("w", &values, &[values.len()], &params, QuantTarget::Int8).unwrap();
        prop_assert!(q.diagnostics.is_empty());

        let restored = dequantize_tensor(&q.codes, &[values.len()], &params).unwrap();
        for (v, r) in values.iter().zip(&restored) {
            prop_assert!((v - r).abs() <= s, "{} vs {}", v, r);
        }
    }

    #[test]
    fn prop_per_channel_round_trip(
        rows in 1_usize..=8,
        cols in 1_usize..=16,
        seed in prop::collection::vec(-1.0_f32..=1.0, 128),
        scales in prop::collection::vec(0.01_f32..=0.5, 8),
    ) {
        let values: Vec<f32> = (0..rows * cols).map(|i| seed[i % seed.len()]).collect();
        let params = QuantParams {
            scale: scales[..rows].to_vec(),
            zero_point: vec![0; rows],
            axis: 0,
        };
        let q = quantize_tensor("w", &values, &[rows, cols], &params, QuantTarget::Int8).unwrap();
        let restored = dequantize_tensor(&q.codes, &[rows, cols], &params).unwrap();

        for (i, (v, r)) in values.iter().zip(&restored).enumerate() {
            let s = params.scale[i / cols];
            prop_assert!((v - r).abs() <= s, "row {}: {} vs {}", i / cols, v, r);
        }
    }
}

// ---------------------------------------------------------------------------
// Property 3: Pack / unpack identity
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_pack_unpack_identity(data in int4_vec()) {
        let packed = pack_int4(&data);
        prop_assert_eq!(unpack_int4(&packed, data.len()), data);
    }

    #[test]
    fn prop_packed_size_is_ceil_half(data in int4_vec()) {
        prop_assert_eq!(pack_int4(&data).len(), data.len().div_ceil(2));
    }
}

// ---------------------------------------------------------------------------
// Property 4: Fold idempotence
// ---------------------------------------------------------------------------

fn value(name: &str) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        ..Default::default()
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn op_node(name: &str, op: OpKind, inputs: &[&str], outputs: &[&str]) -> Node {
    Node::new(name, op, strings(inputs), strings(outputs))
}

proptest! {
    #[test]
    fn prop_second_fold_is_noop(
        weight in prop::collection::vec(-4.0_f32..=4.0, 1..=64),
        s in 0.01_f32..=1.0,
    ) {
        let mut graph = Graph::default();
        graph.inputs = vec![value("x")];
        graph.outputs = vec![value("y")];
        graph.constants = vec![
            Constant::new("w", vec![weight.len() as i64], TensorData::Float(weight.clone())),
            Constant::new("s", vec![], TensorData::Float(vec![s])),
            Constant::new("zp", vec![], TensorData::Int8(vec![0])),
        ];
        graph.nodes = vec![
            op_node("q", OpKind::QuantizeLinear, &["w", "s", "zp"], &["w_q"]),
            op_node("dq", OpKind::DequantizeLinear, &["w_q", "s", "zp"], &["w_dq"]),
            op_node("mul", OpKind::Other("Mul".into()), &["x", "w_dq"], &["y"]),
        ];

        let first = fold_graph(&mut graph).unwrap();
        prop_assert_eq!(first.folded_weights, 1);
        let second = fold_graph(&mut graph).unwrap();
        prop_assert!(second.is_noop());
    }
}
