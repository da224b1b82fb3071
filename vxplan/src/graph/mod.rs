//! Graph collaborator interface.
//!
//! The resolver never owns tensors or nodes. It asks a [`GraphBuilder`] to
//! create transient tensors, reshape views, boxed scalars and kernel nodes,
//! and hands each of them back exactly once through the matching `release_*`
//! call.
//!
//! # Lifecycle
//!
//! ```text
//! create_transient ─┐
//! reshape ──────────┼─> build_node(params in schema order) ─> release_* (scalars, views)
//! create_scalar ────┘                                      └─> release_node (rollback only)
//! ```

pub mod dry_run;

use crate::binder::ParameterSlot;
use crate::error::Result;
use crate::planner::DispatchPlan;
use crate::registry::VariantDescriptor;
use crate::schema::ScalarValue;
use crate::tensor::{TensorInfo, TensorMeta};

pub use dry_run::{DryNode, DryRunGraph, DryScalar, DryTensor, NodeRecord, ParamRecord, TensorOrigin};

/// External graph-construction collaborator
pub trait GraphBuilder {
    /// Tensor handle; cloning copies the handle, not the tensor
    type Tensor: TensorInfo + Clone;
    type Scalar;
    /// Node handle; cloning copies the handle
    type Node: Clone;

    /// Create an intermediate tensor invisible to the operator's caller
    ///
    /// # Errors
    /// Returns [`Error::Graph`](crate::Error::Graph) if the graph refuses
    fn create_transient(&mut self, meta: &TensorMeta) -> Result<Self::Tensor>;

    /// Create a view of `tensor` with a different shape and the same data
    ///
    /// # Errors
    /// Returns [`Error::Graph`](crate::Error::Graph) if the graph refuses
    fn reshape(&mut self, tensor: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor>;

    /// Drop the resolver's reference to a transient tensor or view
    fn release_tensor(&mut self, tensor: Self::Tensor);

    /// Box a scalar kernel parameter
    ///
    /// # Errors
    /// Returns [`Error::Graph`](crate::Error::Graph) if the graph refuses
    fn create_scalar(&mut self, value: ScalarValue) -> Result<Self::Scalar>;

    fn release_scalar(&mut self, scalar: Self::Scalar);

    /// Attach a kernel node with parameters in exact schema order
    ///
    /// # Errors
    /// Returns [`Error::Graph`](crate::Error::Graph) if the node cannot be
    /// created or a parameter is rejected
    fn build_node(
        &mut self,
        variant: &VariantDescriptor,
        plan: &DispatchPlan,
        params: &[NodeParam<'_, Self>],
    ) -> Result<Self::Node>;

    /// Detach a node built earlier in a transaction that is being rolled back
    fn release_node(&mut self, node: Self::Node);
}

/// A parameter as handed to [`GraphBuilder::build_node`]
pub enum NodeParam<'a, G: GraphBuilder + ?Sized> {
    Tensor(&'a G::Tensor),
    Scalar(&'a G::Scalar),
    Absent,
}

/// Invocation-scoped resources for building one node.
///
/// Boxed scalars and reshape views acquired through the scope are released
/// when it drops, whether or not the node was built.
pub struct ScalarScope<'g, G: GraphBuilder> {
    graph: &'g mut G,
    scalars: Vec<G::Scalar>,
    views: Vec<G::Tensor>,
}

impl<'g, G: GraphBuilder> ScalarScope<'g, G> {
    pub fn new(graph: &'g mut G) -> Self {
        Self {
            graph,
            scalars: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Reshape view released with the scope; returns a handle clone
    ///
    /// # Errors
    /// Propagates the graph's error
    pub fn view(&mut self, tensor: &G::Tensor, shape: &[usize]) -> Result<G::Tensor> {
        let view = self.graph.reshape(tensor, shape)?;
        self.views.push(view.clone());
        Ok(view)
    }

    /// Box the scalars of `slots` and build the node.
    ///
    /// # Errors
    /// Propagates scalar creation and node construction errors; scalars
    /// created before the failure are still released on drop
    pub fn build_node(
        &mut self,
        variant: &VariantDescriptor,
        plan: &DispatchPlan,
        slots: &[ParameterSlot<'_, G::Tensor>],
    ) -> Result<G::Node> {
        let first = self.scalars.len();
        for slot in slots {
            if let ParameterSlot::Scalar(value) = slot {
                let scalar = self.graph.create_scalar(*value)?;
                self.scalars.push(scalar);
            }
        }

        let mut boxed = self.scalars[first..].iter();
        let mut params = Vec::with_capacity(slots.len());
        for slot in slots {
            params.push(match slot {
                ParameterSlot::Tensor(t) => NodeParam::Tensor(*t),
                ParameterSlot::Scalar(_) => match boxed.next() {
                    Some(s) => NodeParam::Scalar(s),
                    None => NodeParam::Absent,
                },
                ParameterSlot::Absent => NodeParam::Absent,
            });
        }
        self.graph.build_node(variant, plan, &params)
    }

    /// Number of resources the scope will release
    #[must_use]
    pub fn held(&self) -> usize {
        self.scalars.len() + self.views.len()
    }
}

impl<G: GraphBuilder> Drop for ScalarScope<'_, G> {
    fn drop(&mut self) {
        for scalar in self.scalars.drain(..) {
            self.graph.release_scalar(scalar);
        }
        for view in self.views.drain(..) {
            self.graph.release_tensor(view);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::key::SignatureKey;
    use crate::planner::Geometry;
    use crate::registry::KernelSource;
    use crate::schema::{ParamDef, ParameterSchema, ScalarType};

    const SCHEMA: ParameterSchema = ParameterSchema::new(&[
        ParamDef::input("input"),
        ParamDef::scalar("count", ScalarType::I32),
        ParamDef::scalar("scale", ScalarType::F32),
    ]);

    fn variant() -> VariantDescriptor {
        VariantDescriptor::new(
            SignatureKey::from_raw(1),
            "cl.scope",
            KernelSource::code("scope"),
            SCHEMA,
            Geometry::image(1),
        )
    }

    #[test]
    fn test_scope_releases_on_success() {
        let mut graph = DryRunGraph::new();
        let t = graph.tensor(TensorMeta::new(vec![4, 4], DType::F32));
        {
            let mut scope = ScalarScope::new(&mut graph);
            let view = scope.view(&t, &[16]).unwrap();
            let slots = [
                ParameterSlot::Tensor(&view),
                ParameterSlot::Scalar(ScalarValue::I32(3)),
                ParameterSlot::Scalar(ScalarValue::F32(0.5)),
            ];
            scope
                .build_node(&variant(), &DispatchPlan::exact(1, [16, 1, 1]), &slots)
                .unwrap();
            assert_eq!(scope.held(), 3);
        }
        assert_eq!(graph.live_scalars(), 0);
        assert_eq!(graph.live_tensors(), 0);
        assert_eq!(graph.nodes().len(), 1);
        assert_eq!(graph.nodes()[0].params.len(), 3);
    }

    #[test]
    fn test_scope_releases_on_failure() {
        let mut graph = DryRunGraph::new().fail_node_build_at(0);
        let t = graph.tensor(TensorMeta::new(vec![4], DType::F32));
        {
            let mut scope = ScalarScope::new(&mut graph);
            let slots = [
                ParameterSlot::Tensor(&t),
                ParameterSlot::Scalar(ScalarValue::I32(3)),
            ];
            assert!(scope
                .build_node(&variant(), &DispatchPlan::exact(1, [4, 1, 1]), &slots)
                .is_err());
        }
        assert_eq!(graph.live_scalars(), 0);
        assert!(graph.nodes().is_empty());
        assert_eq!(graph.invalid_releases(), 0);
    }
}
