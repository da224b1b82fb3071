//! Error types for vxplan

use std::fmt;

use thiserror::Error;

use crate::dtype::DType;
use crate::tensor::TensorMeta;

/// Result type alias using vxplan's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for resolution and graph assembly
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not supported: {0}")]
    NotSupported(Box<Unsupported>),

    #[error("Shape constraint violated: {0}")]
    ShapeConstraint(String),

    #[error("Invalid attribute `{name}`: {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("Internal invariant failure: {0}")]
    Internal(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller can recover by trying another family or by
    /// reporting the invocation as unsupported.
    ///
    /// `Internal` errors indicate a registration-time bug and should abort
    /// startup self-checks instead.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotSupported(_) | Self::ShapeConstraint(_) | Self::InvalidAttribute { .. }
        )
    }

    /// Whether this is the `NotSupported` outcome
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn attribute(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Diagnostic payload for [`Error::NotSupported`].
///
/// Carries enough of the invocation to identify the missing registry case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsupported {
    pub op: String,
    pub input_dtypes: Vec<DType>,
    pub output_dtypes: Vec<DType>,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    pub detail: Option<String>,
}

impl Unsupported {
    #[must_use]
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            input_dtypes: Vec::new(),
            output_dtypes: Vec::new(),
            input_shapes: Vec::new(),
            output_shapes: Vec::new(),
            detail: None,
        }
    }

    /// Record the dtypes and shapes of the invocation's tensors
    #[must_use]
    pub fn with_tensors(mut self, inputs: &[TensorMeta], outputs: &[TensorMeta]) -> Self {
        self.input_dtypes = inputs.iter().map(|t| t.dtype).collect();
        self.input_shapes = inputs.iter().map(|t| t.shape.clone()).collect();
        self.output_dtypes = outputs.iter().map(|t| t.dtype).collect();
        self.output_shapes = outputs.iter().map(|t| t.shape.clone()).collect();
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<Unsupported> for Error {
    fn from(u: Unsupported) -> Self {
        Self::NotSupported(Box::new(u))
    }
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op)?;
        write_tensors(f, &self.input_dtypes, &self.input_shapes)?;
        write!(f, ") -> (")?;
        write_tensors(f, &self.output_dtypes, &self.output_shapes)?;
        write!(f, ")")?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

fn write_tensors(f: &mut fmt::Formatter<'_>, dtypes: &[DType], shapes: &[Vec<usize>]) -> fmt::Result {
    for (i, dtype) in dtypes.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{dtype}")?;
        if let Some(shape) = shapes.get(i) {
            write!(f, "{shape:?}")?;
        }
    }
    Ok(())
}
