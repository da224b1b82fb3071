//! Shared helpers for operator resolution tests.
//!
//! Builds resolvers over the linked families and declares caller tensors on
//! a dry-run graph.

#![allow(dead_code)]

use vxplan::graph::{DryTensor, ParamRecord};
use vxplan::{
    AttributeBag, Capability, DType, DryRunGraph, ExecutionPlan, Quantization, Resolver,
    ResolverConfig, Result, TensorMeta,
};

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn resolver() -> Resolver {
    init_logging();
    vxplan_ops::resolver(ResolverConfig::default()).expect("registry builds")
}

pub fn resolver_with(capability: Capability) -> Resolver {
    init_logging();
    vxplan_ops::resolver(ResolverConfig::default().with_capability(capability)).expect("registry builds")
}

pub fn meta(shape: &[usize], dtype: DType) -> TensorMeta {
    TensorMeta::new(shape.to_vec(), dtype)
}

pub fn quantized(shape: &[usize], dtype: DType, scale: f32, zero_point: i32) -> TensorMeta {
    meta(shape, dtype).with_quantization(Quantization::affine(scale, zero_point))
}

/// Caller tensors declared on one graph
pub struct Invocation {
    pub graph: DryRunGraph,
    pub inputs: Vec<DryTensor>,
    pub outputs: Vec<DryTensor>,
}

impl Invocation {
    pub fn new(inputs: Vec<TensorMeta>, outputs: Vec<TensorMeta>) -> Self {
        Self::on(DryRunGraph::new(), inputs, outputs)
    }

    /// Declare tensors on a prepared graph, e.g. one with injected failures
    pub fn on(mut graph: DryRunGraph, inputs: Vec<TensorMeta>, outputs: Vec<TensorMeta>) -> Self {
        let inputs = inputs.into_iter().map(|m| graph.tensor(m)).collect();
        let outputs = outputs.into_iter().map(|m| graph.tensor(m)).collect();
        Self {
            graph,
            inputs,
            outputs,
        }
    }

    pub fn resolve(
        &mut self,
        resolver: &Resolver,
        op: &str,
        attrs: &AttributeBag,
    ) -> Result<ExecutionPlan<DryRunGraph>> {
        resolver.resolve(&mut self.graph, op, &self.inputs, &self.outputs, attrs)
    }

    /// Nothing created by the resolver is still held
    pub fn assert_no_leaks(&self) {
        assert_eq!(self.graph.live_tensors(), 0, "transients or views leaked");
        assert_eq!(self.graph.live_scalars(), 0, "scalars leaked");
        assert_eq!(self.graph.invalid_releases(), 0, "double or foreign release");
    }
}

/// Scalar parameters of a recorded node, in schema order
pub fn scalar_params(params: &[ParamRecord]) -> Vec<vxplan::ScalarValue> {
    params
        .iter()
        .filter_map(|p| match p {
            ParamRecord::Scalar { value } => Some(*value),
            _ => None,
        })
        .collect()
}
