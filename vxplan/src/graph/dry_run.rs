//! In-memory graph that records nodes instead of executing anything.
//!
//! Used for dry-run planning from the command line and for verifying
//! resource accounting in tests: every transient, view and scalar handed out
//! is tracked until released, and failures can be injected at a chosen call.

use std::collections::BTreeSet;

use serde::Serialize;

use super::{GraphBuilder, NodeParam};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::planner::DispatchPlan;
use crate::registry::VariantDescriptor;
use crate::schema::ScalarValue;
use crate::tensor::{Quantization, TensorInfo, TensorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorOrigin {
    /// Declared by the caller; never released by the resolver
    Caller,
    Transient,
    View,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DryTensor {
    pub id: usize,
    pub origin: TensorOrigin,
    meta: TensorMeta,
}

impl TensorInfo for DryTensor {
    fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    fn dtype(&self) -> DType {
        self.meta.dtype
    }

    fn quantization(&self) -> Quantization {
        self.meta.quantization
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DryScalar {
    pub id: usize,
    pub value: ScalarValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DryNode {
    pub id: usize,
}

/// A recorded kernel parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParamRecord {
    Tensor {
        id: usize,
        origin: TensorOrigin,
        shape: Vec<usize>,
        dtype: DType,
    },
    Scalar {
        value: ScalarValue,
    },
    Absent,
}

/// A node attached to the dry-run graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub id: usize,
    pub kernel_name: String,
    pub dispatch: DispatchPlan,
    pub params: Vec<ParamRecord>,
}

#[derive(Debug, Default)]
pub struct DryRunGraph {
    next_id: usize,
    live_tensors: BTreeSet<usize>,
    live_scalars: BTreeSet<usize>,
    nodes: Vec<NodeRecord>,
    transients_created: usize,
    node_builds: usize,
    transient_creates: usize,
    invalid_releases: usize,
    fail_node_build_at: Option<usize>,
    fail_transient_at: Option<usize>,
}

impl DryRunGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th `build_node` call (0-based) fail
    #[must_use]
    pub fn fail_node_build_at(mut self, n: usize) -> Self {
        self.fail_node_build_at = Some(n);
        self
    }

    /// Make the `n`-th `create_transient` call (0-based) fail
    #[must_use]
    pub fn fail_transient_at(mut self, n: usize) -> Self {
        self.fail_transient_at = Some(n);
        self
    }

    /// Declare a caller-owned tensor
    pub fn tensor(&mut self, meta: TensorMeta) -> DryTensor {
        DryTensor {
            id: self.fresh_id(),
            origin: TensorOrigin::Caller,
            meta,
        }
    }

    /// Nodes currently attached, in build order
    #[must_use]
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Transients and views not yet released
    #[must_use]
    pub fn live_tensors(&self) -> usize {
        self.live_tensors.len()
    }

    #[must_use]
    pub fn live_scalars(&self) -> usize {
        self.live_scalars.len()
    }

    /// Transients ever created, released or not
    #[must_use]
    pub fn transients_created(&self) -> usize {
        self.transients_created
    }

    /// Releases of handles that were not live: double releases or releases
    /// of caller tensors
    #[must_use]
    pub fn invalid_releases(&self) -> usize {
        self.invalid_releases
    }

    fn fresh_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl GraphBuilder for DryRunGraph {
    type Tensor = DryTensor;
    type Scalar = DryScalar;
    type Node = DryNode;

    fn create_transient(&mut self, meta: &TensorMeta) -> Result<DryTensor> {
        let call = self.transient_creates;
        self.transient_creates += 1;
        if self.fail_transient_at == Some(call) {
            return Err(Error::Graph(format!("injected failure creating transient #{call}")));
        }
        let id = self.fresh_id();
        self.live_tensors.insert(id);
        self.transients_created += 1;
        Ok(DryTensor {
            id,
            origin: TensorOrigin::Transient,
            meta: meta.clone(),
        })
    }

    fn reshape(&mut self, tensor: &DryTensor, shape: &[usize]) -> Result<DryTensor> {
        let numel: usize = shape.iter().product();
        if numel != tensor.numel() {
            return Err(Error::Graph(format!(
                "cannot view {:?} as {shape:?}",
                tensor.shape()
            )));
        }
        let id = self.fresh_id();
        self.live_tensors.insert(id);
        Ok(DryTensor {
            id,
            origin: TensorOrigin::View,
            meta: TensorMeta {
                shape: shape.to_vec(),
                ..tensor.meta.clone()
            },
        })
    }

    fn release_tensor(&mut self, tensor: DryTensor) {
        if !self.live_tensors.remove(&tensor.id) {
            self.invalid_releases += 1;
        }
    }

    fn create_scalar(&mut self, value: ScalarValue) -> Result<DryScalar> {
        let id = self.fresh_id();
        self.live_scalars.insert(id);
        Ok(DryScalar { id, value })
    }

    fn release_scalar(&mut self, scalar: DryScalar) {
        if !self.live_scalars.remove(&scalar.id) {
            self.invalid_releases += 1;
        }
    }

    fn build_node(
        &mut self,
        variant: &VariantDescriptor,
        plan: &DispatchPlan,
        params: &[NodeParam<'_, Self>],
    ) -> Result<DryNode> {
        let call = self.node_builds;
        self.node_builds += 1;
        if self.fail_node_build_at == Some(call) {
            return Err(Error::Graph(format!(
                "injected failure building `{}`",
                variant.kernel_name
            )));
        }
        if params.len() != variant.schema.len() {
            return Err(Error::Graph(format!(
                "`{}` takes {} parameters, got {}",
                variant.kernel_name,
                variant.schema.len(),
                params.len()
            )));
        }
        let params = params
            .iter()
            .map(|p| match p {
                NodeParam::Tensor(t) => ParamRecord::Tensor {
                    id: t.id,
                    origin: t.origin,
                    shape: t.meta.shape.clone(),
                    dtype: t.meta.dtype,
                },
                NodeParam::Scalar(s) => ParamRecord::Scalar { value: s.value },
                NodeParam::Absent => ParamRecord::Absent,
            })
            .collect();
        let id = self.fresh_id();
        self.nodes.push(NodeRecord {
            id,
            kernel_name: variant.kernel_name.clone(),
            dispatch: plan.clone(),
            params,
        });
        Ok(DryNode { id })
    }

    fn release_node(&mut self, node: DryNode) {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != node.id);
        if self.nodes.len() == before {
            self.invalid_releases += 1;
        }
    }
}
