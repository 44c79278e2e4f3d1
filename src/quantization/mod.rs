//! Numeric quantization of folded constants.
//!
//! `q = round(v / scale) + zero_point`, evaluated in f64/i64, then clipped to
//! the destination range. Per-channel parameters are broadcast along `axis`.
//!
//! Ties round half to even (`f64::round_ties_even`), the same rule NumPy's
//! `round` uses, so folded weights are bit-identical to those produced by
//! the usual Python tooling.

pub mod packing;

pub use packing::{pack_int4, unpack_int4};

use crate::errors::{FoldError, Result};
use crate::graph::TensorData;
use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};
use std::fmt;

/// Integer type a constant is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantTarget {
    Int8,
    Uint8,
    Int32,
    /// Signed 4-bit, stored one value per `i8` until the writer packs it.
    Int4,
}

impl QuantTarget {
    /// Inclusive clip range.
    pub fn range(self) -> (i64, i64) {
        match self {
            QuantTarget::Int8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
            QuantTarget::Uint8 => (0, i64::from(u8::MAX)),
            QuantTarget::Int32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
            QuantTarget::Int4 => (-8, 7),
        }
    }

    /// Element storage for already-clipped codes.
    pub fn to_tensor_data(self, codes: &[i64]) -> TensorData {
        match self {
            QuantTarget::Int8 | QuantTarget::Int4 => {
                TensorData::Int8(codes.iter().map(|&c| c as i8).collect())
            }
            QuantTarget::Uint8 => TensorData::Uint8(codes.iter().map(|&c| c as u8).collect()),
            QuantTarget::Int32 => TensorData::Int32(codes.iter().map(|&c| c as i32).collect()),
        }
    }
}

impl fmt::Display for QuantTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuantTarget::Int8 => "int8",
            QuantTarget::Uint8 => "uint8",
            QuantTarget::Int32 => "int32",
            QuantTarget::Int4 => "int4",
        };
        f.write_str(s)
    }
}

/// Scale / zero-point / axis for one quantization site.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i64>,
    pub axis: i64,
}

impl QuantParams {
    pub fn per_tensor(scale: f32, zero_point: i64) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            axis: 0,
        }
    }

    pub fn is_per_channel(&self) -> bool {
        self.scale.len() > 1 || self.zero_point.len() > 1
    }
}

/// Non-fatal diagnostic: some codes fell outside the destination range and
/// were clipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipWarning {
    pub parameter: String,
    /// Node whose constant was folded; empty until the rewriter fills it in.
    pub node: String,
    pub unclipped_min: i64,
    pub unclipped_max: i64,
    pub clip_min: i64,
    pub clip_max: i64,
}

impl fmt::Display for ClipWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter {}", self.parameter)?;
        if !self.node.is_empty() {
            write!(f, " (node {})", self.node)?;
        }
        write!(
            f,
            " in quantized range [{}, {}] is being clipped to [{}, {}]; \
             this may result in accuracy loss",
            self.unclipped_min, self.unclipped_max, self.clip_min, self.clip_max
        )
    }
}

/// Clipped codes plus any diagnostics raised while producing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub codes: Vec<i64>,
    pub diagnostics: Vec<ClipWarning>,
}

fn normalize_axis(parameter: &str, axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    if axis < -rank_i || axis >= rank_i.max(1) {
        return Err(FoldError::ShapeMismatch {
            parameter: parameter.to_string(),
            reason: format!("axis {axis} is out of range for rank {rank}"),
        });
    }
    Ok(axis.rem_euclid(rank_i) as usize)
}

fn element_count(parameter: &str, dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| FoldError::InvalidTensor {
            name: parameter.to_string(),
            reason: format!("element count of dims {dims:?} overflows"),
        })
}

fn check_param_len(
    parameter: &str,
    what: &str,
    len: usize,
    channels: usize,
    axis: usize,
) -> Result<()> {
    if len == 1 || len == channels {
        return Ok(());
    }
    Err(FoldError::ShapeMismatch {
        parameter: parameter.to_string(),
        reason: format!(
            "{what} has {len} elements but must have 1 or {channels} (dimension {axis})"
        ),
    })
}

fn quantize_code(value: f32, scale: f64, zero_point: i64) -> i64 {
    ((f64::from(value) / scale).round_ties_even() as i64).saturating_add(zero_point)
}

/// Quantize a float tensor into `target`.
///
/// `parameter` names the tensor in diagnostics and errors. Out-of-range
/// codes are clipped and reported through [`Quantized::diagnostics`]; a
/// scale or zero-point that does not broadcast along `axis` is a
/// [`FoldError::ShapeMismatch`].
pub fn quantize_tensor(
    parameter: &str,
    values: &[f32],
    dims: &[usize],
    params: &QuantParams,
    target: QuantTarget,
) -> Result<Quantized> {
    let numel = element_count(parameter, dims)?;
    if values.len() != numel {
        return Err(FoldError::InvalidTensor {
            name: parameter.to_string(),
            reason: format!("{} values for dims {:?}", values.len(), dims),
        });
    }
    if params.scale.is_empty() || params.zero_point.is_empty() {
        return Err(FoldError::ShapeMismatch {
            parameter: parameter.to_string(),
            reason: "empty scale or zero-point".into(),
        });
    }

    let unclipped: Vec<i64> = if dims.is_empty() {
        check_param_len(parameter, "scale", params.scale.len(), 1, 0)?;
        check_param_len(parameter, "zero-point", params.zero_point.len(), 1, 0)?;
        vec![quantize_code(values[0], f64::from(params.scale[0]), params.zero_point[0])]
    } else {
        let axis = normalize_axis(parameter, params.axis, dims.len())?;
        let channels = dims[axis];
        check_param_len(parameter, "scale", params.scale.len(), channels, axis)?;
        check_param_len(parameter, "zero-point", params.zero_point.len(), channels, axis)?;

        // [n, 1, ..., 1]: one leading entry per channel, ones for the trailing dims.
        let trailing_ones = dims.len() - axis - 1;
        let shape_of = |n: usize| {
            let mut shape = vec![1usize; trailing_ones + 1];
            shape[0] = n;
            shape
        };

        let shape_err = |e: ndarray::ShapeError| FoldError::ShapeMismatch {
            parameter: parameter.to_string(),
            reason: e.to_string(),
        };
        let broadcast_err = || FoldError::ShapeMismatch {
            parameter: parameter.to_string(),
            reason: format!("quantization parameters do not broadcast against {dims:?}"),
        };

        let w = ArrayViewD::from_shape(IxDyn(dims), values).map_err(shape_err)?;
        let s = ArrayD::from_shape_vec(
            IxDyn(&shape_of(params.scale.len())),
            params.scale.iter().map(|&v| f64::from(v)).collect(),
        )
        .map_err(shape_err)?;
        let z = ArrayD::from_shape_vec(
            IxDyn(&shape_of(params.zero_point.len())),
            params.zero_point.clone(),
        )
        .map_err(shape_err)?;

        let s = s.broadcast(w.raw_dim()).ok_or_else(broadcast_err)?;
        let z = z.broadcast(w.raw_dim()).ok_or_else(broadcast_err)?;

        let codes = Zip::from(&w)
            .and(&s)
            .and(&z)
            .map_collect(|&v, &s, &z| quantize_code(v, s, z));
        codes.iter().copied().collect()
    };

    let (lo, hi) = target.range();
    let mut diagnostics = Vec::new();
    if let (Some(&min), Some(&max)) = (unclipped.iter().min(), unclipped.iter().max()) {
        if min < lo || max > hi {
            diagnostics.push(ClipWarning {
                parameter: parameter.to_string(),
                node: String::new(),
                unclipped_min: min,
                unclipped_max: max,
                clip_min: lo,
                clip_max: hi,
            });
        }
    }

    Ok(Quantized {
        codes: unclipped.into_iter().map(|c| c.clamp(lo, hi)).collect(),
        diagnostics,
    })
}

/// `(code - zero_point) * scale`, broadcast the same way as [`quantize_tensor`].
pub fn dequantize_tensor(codes: &[i64], dims: &[usize], params: &QuantParams) -> Result<Vec<f32>> {
    const PARAMETER: &str = "dequantize";
    let numel = element_count(PARAMETER, dims)?;
    if codes.len() != numel {
        return Err(FoldError::InvalidTensor {
            name: PARAMETER.to_string(),
            reason: format!("{} codes for dims {:?}", codes.len(), dims),
        });
    }

    let (axis, channels) = if dims.is_empty() {
        (0, 1)
    } else {
        let axis = normalize_axis(PARAMETER, params.axis, dims.len())?;
        (axis, dims[axis])
    };
    check_param_len(PARAMETER, "scale", params.scale.len(), channels, axis)?;
    check_param_len(PARAMETER, "zero-point", params.zero_point.len(), channels, axis)?;

    let inner: usize = dims.get(axis + 1..).map_or(1, |d| d.iter().product());
    Ok(codes
        .iter()
        .enumerate()
        .map(|(i, &code)| {
            let c = (i / inner.max(1)) % channels.max(1);
            let scale = params.scale[if params.scale.len() == 1 { 0 } else { c }];
            let zp = params.zero_point[if params.zero_point.len() == 1 { 0 } else { c }];
            ((code - zp) as f64 * f64::from(scale)) as f32
        })
        .collect())
}

/// Bias parameters for a quantized Gemm/Conv: `scale = input_scale *
/// weight_scale`, zero-point 0, int32 accumulator target.
///
/// Either scale may be per-tensor (one element); otherwise both must have
/// the same length.
pub fn derive_bias_params(
    parameter: &str,
    input_scale: &[f32],
    weight_scale: &[f32],
) -> Result<QuantParams> {
    let scale: Vec<f32> = match (input_scale.len(), weight_scale.len()) {
        (1, _) => weight_scale.iter().map(|&w| input_scale[0] * w).collect(),
        (_, 1) => input_scale.iter().map(|&i| i * weight_scale[0]).collect(),
        (a, b) if a == b => input_scale
            .iter()
            .zip(weight_scale)
            .map(|(&i, &w)| i * w)
            .collect(),
        (a, b) => {
            return Err(FoldError::ShapeMismatch {
                parameter: parameter.to_string(),
                reason: format!("input scale ({a}) and weight scale ({b}) do not broadcast"),
            })
        }
    };
    if scale.is_empty() {
        return Err(FoldError::ShapeMismatch {
            parameter: parameter.to_string(),
            reason: "empty input or weight scale".into(),
        });
    }

    Ok(QuantParams {
        zero_point: vec![0; scale.len()],
        scale,
        axis: 0,
    })
}
