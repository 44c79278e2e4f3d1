//! Constants (initializers) and their element storage.
//!
//! Only the element types the folding pass reads or produces are decoded:
//! float32, uint8, int8 and int32. INT4 initializers are widened to int8 on
//! load and the caller records their names so the writer can pack them again
//! (see `Graph::int4_initializers`). Everything else is carried as an opaque
//! `TensorProto` and written back untouched.

use crate::errors::{FoldError, Result};
use crate::onnx_proto::{tensor_proto, TensorProto};
use crate::quantization::unpack_int4;

/// Product of `dims` with negative extents counted as zero, or `None` when
/// it does not fit in `usize`.
pub(crate) fn element_count(dims: &[i64]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(usize::try_from(d.max(0)).ok()?)
    })
}

/// Element types the in-memory graph stores natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float,
    Uint8,
    Int8,
    Int32,
}

impl ElementType {
    /// ONNX `TensorProto.DataType` code.
    pub fn onnx_code(self) -> i32 {
        let dt = match self {
            ElementType::Float => tensor_proto::DataType::Float,
            ElementType::Uint8 => tensor_proto::DataType::Uint8,
            ElementType::Int8 => tensor_proto::DataType::Int8,
            ElementType::Int32 => tensor_proto::DataType::Int32,
        };
        dt as i32
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match tensor_proto::DataType::try_from(code).ok()? {
            tensor_proto::DataType::Float => Some(ElementType::Float),
            tensor_proto::DataType::Uint8 => Some(ElementType::Uint8),
            tensor_proto::DataType::Int8 => Some(ElementType::Int8),
            tensor_proto::DataType::Int32 => Some(ElementType::Int32),
            _ => None,
        }
    }
}

/// Element data of a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Int32(Vec<i32>),
    /// Any other element type, kept verbatim.
    Opaque(TensorProto),
}

impl TensorData {
    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            TensorData::Float(_) => Some(ElementType::Float),
            TensorData::Uint8(_) => Some(ElementType::Uint8),
            TensorData::Int8(_) => Some(ElementType::Int8),
            TensorData::Int32(_) => Some(ElementType::Int32),
            TensorData::Opaque(_) => None,
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            TensorData::Float(v) => Some(v.len()),
            TensorData::Uint8(v) => Some(v.len()),
            TensorData::Int8(v) => Some(v.len()),
            TensorData::Int32(v) => Some(v.len()),
            TensorData::Opaque(_) => None,
        }
    }

    /// Little-endian `raw_data` bytes.
    fn to_raw_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Uint8(v) => v.clone(),
            TensorData::Int8(v) => v.iter().map(|&x| x as u8).collect(),
            TensorData::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Opaque(t) => t.raw_data.clone(),
        }
    }
}

/// A named, immutable tensor stored in the graph (an ONNX initializer).
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub name: String,
    pub dims: Vec<i64>,
    pub data: TensorData,
}

impl Constant {
    pub fn new(name: impl Into<String>, dims: Vec<i64>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            dims,
            data,
        }
    }

    /// Number of elements implied by `dims` (1 for a scalar).
    pub fn num_elements(&self) -> Result<usize> {
        element_count(&self.dims).ok_or_else(|| FoldError::InvalidTensor {
            name: self.name.clone(),
            reason: format!("element count of dims {:?} overflows", self.dims),
        })
    }

    /// Dimensions as `usize`, rejecting negative extents.
    pub fn shape(&self) -> Result<Vec<usize>> {
        self.dims
            .iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| FoldError::InvalidTensor {
                    name: self.name.clone(),
                    reason: format!("negative dimension {d} in {:?}", self.dims),
                })
            })
            .collect()
    }

    pub fn element_type(&self) -> Option<ElementType> {
        self.data.element_type()
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::Float(v) => Ok(v),
            _ => Err(FoldError::InvalidTensor {
                name: self.name.clone(),
                reason: "expected a float32 tensor".into(),
            }),
        }
    }

    /// Integer view used for zero-points.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match &self.data {
            TensorData::Uint8(v) => Ok(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Int8(v) => Ok(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::Int32(v) => Ok(v.iter().map(|&x| i64::from(x)).collect()),
            _ => Err(FoldError::InvalidTensor {
                name: self.name.clone(),
                reason: "expected an integer tensor".into(),
            }),
        }
    }

    /// Decode an initializer. Returns the constant and whether it was stored
    /// as INT4 (and therefore widened to int8 storage).
    ///
    /// External data must already be resolved into `raw_data`.
    pub fn from_proto(tensor: TensorProto) -> Result<(Self, bool)> {
        let dtype = match tensor_proto::DataType::try_from(tensor.data_type) {
            Ok(
                dt @ (tensor_proto::DataType::Float
                | tensor_proto::DataType::Uint8
                | tensor_proto::DataType::Int8
                | tensor_proto::DataType::Int32
                | tensor_proto::DataType::Int4),
            ) => dt,
            _ => {
                let name = tensor.name.clone();
                let dims = tensor.dims.clone();
                return Ok((Self::new(name, dims, TensorData::Opaque(tensor)), false));
            }
        };

        let invalid = |reason: String| FoldError::InvalidTensor {
            name: tensor.name.clone(),
            reason,
        };

        if tensor.data_location() == tensor_proto::DataLocation::External {
            return Err(invalid("external data was not resolved before decoding".into()));
        }

        let numel = element_count(&tensor.dims)
            .ok_or_else(|| invalid(format!("element count of dims {:?} overflows", tensor.dims)))?;
        let raw = &tensor.raw_data;
        let mut is_int4 = false;

        let data = match dtype {
            tensor_proto::DataType::Float => {
                if raw.is_empty() {
                    TensorData::Float(tensor.float_data.clone())
                } else {
                    if raw.len() % 4 != 0 {
                        return Err(invalid(format!(
                            "raw_data length {} is not a multiple of 4",
                            raw.len()
                        )));
                    }
                    TensorData::Float(
                        raw.chunks_exact(4)
                            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                            .collect(),
                    )
                }
            }
            tensor_proto::DataType::Uint8 => {
                if raw.is_empty() {
                    TensorData::Uint8(tensor.int32_data.iter().map(|&v| v as u8).collect())
                } else {
                    TensorData::Uint8(raw.clone())
                }
            }
            tensor_proto::DataType::Int8 => {
                if raw.is_empty() {
                    TensorData::Int8(tensor.int32_data.iter().map(|&v| v as i8).collect())
                } else {
                    TensorData::Int8(raw.iter().map(|&b| b as i8).collect())
                }
            }
            tensor_proto::DataType::Int32 => {
                if raw.is_empty() {
                    TensorData::Int32(tensor.int32_data.clone())
                } else {
                    if raw.len() % 4 != 0 {
                        return Err(invalid(format!(
                            "raw_data length {} is not a multiple of 4",
                            raw.len()
                        )));
                    }
                    TensorData::Int32(
                        raw.chunks_exact(4)
                            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                            .collect(),
                    )
                }
            }
            tensor_proto::DataType::Int4 => {
                // Two nibbles per byte, either in raw_data or one byte per int32_data entry.
                let packed: Vec<u8> = if raw.is_empty() {
                    tensor.int32_data.iter().map(|&v| v as u8).collect()
                } else {
                    raw.clone()
                };
                if packed.len() != numel.div_ceil(2) {
                    return Err(invalid(format!(
                        "packed INT4 payload has {} bytes, expected {}",
                        packed.len(),
                        numel.div_ceil(2)
                    )));
                }
                is_int4 = true;
                TensorData::Int8(unpack_int4(&packed, numel))
            }
            _ => unreachable!("non-native element types are returned as opaque above"),
        };

        if let Some(len) = data.len() {
            if len != numel {
                return Err(invalid(format!(
                    "holds {len} elements but dims {:?} imply {numel}",
                    tensor.dims
                )));
            }
        }

        Ok((Self::new(tensor.name.clone(), tensor.dims.clone(), data), is_int4))
    }

    /// Encode as an initializer. Native types are always written as
    /// little-endian `raw_data`.
    pub fn to_proto(&self) -> TensorProto {
        match &self.data {
            TensorData::Opaque(t) => {
                let mut t = t.clone();
                t.name = self.name.clone();
                t
            }
            data => TensorProto {
                name: self.name.clone(),
                dims: self.dims.clone(),
                data_type: data
                    .element_type()
                    .map(ElementType::onnx_code)
                    .unwrap_or_default(),
                raw_data: data.to_raw_bytes(),
                ..Default::default()
            },
        }
    }
}
