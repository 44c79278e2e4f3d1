//! Criterion benchmarks for qdq-fold.
//!
//! Run with: `cargo bench`
//!
//! # Benchmark groups
//!
//! 1. **quantize_throughput**: INT8 and INT4 per-tensor quantization at
//!    1 K, 100 K, and 1 M elements; reported as elements/second.
//!
//! 2. **per_channel_vs_per_tensor**: a [64, 27] (1 728-element) weight
//!    quantized with one scale and with 64 scales along axis 0.
//!
//! 3. **pack_int4**: raw `pack_int4` and `unpack_int4` throughput at
//!    10 K, 100 K, and 1 M elements.
//!
//! 4. **fold_graph**: a full match/rewrite/cleanup pass over a chain of
//!    QDQ-wrapped MatMul weights (no I/O).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qdq_fold::graph::{Constant, Graph, Node, OpKind, TensorData};
use qdq_fold::onnx_proto::ValueInfoProto;
use qdq_fold::{fold_graph, pack_int4, quantize_tensor, unpack_int4, QuantParams, QuantTarget};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a deterministic `Vec<f32>` of `n` elements in the range [-1, 1].
fn synthetic_f32(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = (i as f32) / (n as f32);
            (t * std::f32::consts::TAU).sin()
        })
        .collect()
}

/// Generate a `Vec<i8>` of `n` INT4-valid values (`[-8, 7]`).
fn synthetic_i8_int4(n: usize) -> Vec<i8> {
    (0..n).map(|i| ((i % 16) as i8) - 8).collect()
}

/// `layers` MatMuls in sequence, each with a QDQ-wrapped `[dim, dim]` weight.
fn synthetic_graph(layers: usize, dim: usize) -> Graph {
    let mut graph = Graph::default();
    graph.inputs = vec![ValueInfoProto {
        name: "act_0".to_string(),
        ..Default::default()
    }];
    graph.outputs = vec![ValueInfoProto {
        name: format!("act_{layers}"),
        ..Default::default()
    }];
    graph.constants.push(Constant::new("s", vec![], TensorData::Float(vec![0.01])));
    graph.constants.push(Constant::new("zp", vec![], TensorData::Int8(vec![0])));

    let weight = synthetic_f32(dim * dim);
    for l in 0..layers {
        let w = format!("w{l}");
        let wq = format!("w{l}_q");
        let wdq = format!("w{l}_dq");
        graph.constants.push(Constant::new(
            w.clone(),
            vec![dim as i64, dim as i64],
            TensorData::Float(weight.clone()),
        ));
        graph.nodes.push(Node::new(
            format!("q{l}"),
            OpKind::QuantizeLinear,
            vec![w, "s".into(), "zp".into()],
            vec![wq.clone()],
        ));
        graph.nodes.push(Node::new(
            format!("dq{l}"),
            OpKind::DequantizeLinear,
            vec![wq, "s".into(), "zp".into()],
            vec![wdq.clone()],
        ));
        graph.nodes.push(Node::new(
            format!("mm{l}"),
            OpKind::Other("MatMul".into()),
            vec![format!("act_{l}"), wdq],
            vec![format!("act_{}", l + 1)],
        ));
    }
    graph
}

// ---------------------------------------------------------------------------
// Group 1: Quantize throughput
// ---------------------------------------------------------------------------

fn bench_quantize_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize_throughput");
    let params = QuantParams::per_tensor(1.0 / 127.0, 0);

    for &n in &[1_000_usize, 100_000, 1_000_000] {
        let data = synthetic_f32(n);
        let dims = [n];

        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("int8", n), &data, |b, d| {
            b.iter(|| {
                quantize_tensor("w", black_box(d), &dims, &params, QuantTarget::Int8).unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("int4", n), &data, |b, d| {
            b.iter(|| {
                quantize_tensor("w", black_box(d), &dims, &params, QuantTarget::Int4).unwrap()
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Group 2: Per-channel vs per-tensor
// ---------------------------------------------------------------------------

fn bench_per_channel_vs_per_tensor(c: &mut Criterion) {
    let mut group = c.benchmark_group("per_channel_vs_per_tensor");
    let data = synthetic_f32(64 * 27);
    let dims = [64, 27];

    let per_tensor = QuantParams::per_tensor(0.01, 0);
    let per_channel = QuantParams {
        scale: (0..64).map(|i| 0.005 + i as f32 * 1e-4).collect(),
        zero_point: vec![0; 64],
        axis: 0,
    };

    group.bench_function("per_tensor", |b| {
        b.iter(|| {
            quantize_tensor("w", black_box(&data), &dims, &per_tensor, QuantTarget::Int8).unwrap()
        });
    });
    group.bench_function("per_channel", |b| {
        b.iter(|| {
            quantize_tensor("w", black_box(&data), &dims, &per_channel, QuantTarget::Int8).unwrap()
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Group 3: INT4 packing
// ---------------------------------------------------------------------------

fn bench_pack_int4(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_int4");

    for &n in &[10_000_usize, 100_000, 1_000_000] {
        let values = synthetic_i8_int4(n);
        let packed = pack_int4(&values);

        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("pack", n), &values, |b, v| {
            b.iter(|| pack_int4(black_box(v)));
        });
        group.bench_with_input(BenchmarkId::new("unpack", n), &packed, |b, p| {
            b.iter(|| unpack_int4(black_box(p), n));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Group 4: Whole-graph fold
// ---------------------------------------------------------------------------

fn bench_fold_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold_graph");

    for &layers in &[8_usize, 64] {
        let graph = synthetic_graph(layers, 64);
        group.bench_with_input(BenchmarkId::new("matmul_chain", layers), &graph, |b, g| {
            b.iter(|| {
                let mut g = g.clone();
                fold_graph(black_box(&mut g)).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_quantize_throughput,
    bench_per_channel_vs_per_tensor,
    bench_pack_int4,
    bench_fold_graph
);
criterion_main!(benches);
