//! Tensor metadata as read by the resolver

use serde::{Deserialize, Serialize};

use crate::dtype::DType;

/// Quantization scheme attached to a tensor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Quantization {
    #[default]
    None,
    /// `real = scale * (stored - zero_point)`
    Affine { scale: f32, zero_point: i32 },
    /// `real = stored * 2^-fraction_length`
    DynamicFixedPoint { fraction_length: i8 },
}

impl Quantization {
    #[must_use]
    pub fn affine(scale: f32, zero_point: i32) -> Self {
        Self::Affine { scale, zero_point }
    }

    /// Effective scale; 1.0 for non-quantized tensors
    #[must_use]
    pub fn scale(&self) -> f32 {
        match *self {
            Self::None => 1.0,
            Self::Affine { scale, .. } => scale,
            Self::DynamicFixedPoint { fraction_length } => {
                2f32.powi(-i32::from(fraction_length))
            }
        }
    }

    /// Effective zero point; 0 unless affine
    #[must_use]
    pub fn zero_point(&self) -> i32 {
        match *self {
            Self::Affine { zero_point, .. } => zero_point,
            _ => 0,
        }
    }

    /// Additive term that dequantizes a stored value after scaling:
    /// `-(zero_point * scale)`
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn tail(&self) -> f32 {
        -(self.zero_point() as f32 * self.scale())
    }

    #[must_use]
    pub fn is_quantized(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Read access to the parts of a tensor handle the resolver consumes
pub trait TensorInfo {
    /// Extents, innermost first (`shape[0]` is the fastest-varying axis)
    fn shape(&self) -> &[usize];

    fn dtype(&self) -> DType;

    fn quantization(&self) -> Quantization;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Owned snapshot of this tensor's metadata
    fn meta(&self) -> TensorMeta {
        TensorMeta {
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
            quantization: self.quantization(),
        }
    }
}

/// Owned tensor metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
    #[serde(default)]
    pub quantization: Quantization,
}

impl TensorMeta {
    #[must_use]
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            quantization: Quantization::None,
        }
    }

    #[must_use]
    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = quantization;
        self
    }
}

impl TensorInfo for TensorMeta {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn quantization(&self) -> Quantization {
        self.quantization
    }
}
