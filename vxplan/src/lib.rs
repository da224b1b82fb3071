//! vxplan: kernel variant resolution and execution-graph assembly
//!
//! This crate turns a logical operator invocation (tensor shapes, dtypes,
//! quantization and attributes) into concrete kernel nodes: it selects a
//! specialized variant from a static registry, plans its dispatch grid,
//! binds its parameters and, for multi-pass operators, chains stages through
//! transient tensors. Operator families live in separate crates and register
//! themselves through `inventory`.

pub mod attrs;
pub mod binder;
pub mod classify;
pub mod composer;
pub mod config;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod key;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod shape;
pub mod tensor;

pub use attrs::{AttrValue, AttributeBag};
pub use binder::{bind, bind_derived, DeriveFn, Derivation, ParameterSlot, ScalarSet};
pub use classify::{FoldingTable, TypeClass};
pub use composer::{
    Binding, ExecutionPlan, PipelineComposer, PipelineStage, PipelineTemplate, SlotSummary,
    StageSpec, TransientRecord, TransientSpec,
};
pub use config::{Capability, ResolverConfig};
pub use dtype::{splat_packed, DType, ScalarElement};
pub use error::{Error, Result, Unsupported};
pub use graph::{DryRunGraph, GraphBuilder, NodeParam, ScalarScope};
pub use key::{KeyLayout, SignatureKey};
pub use planner::{
    quantize_multiplier_16bit, ConstValue, DispatchPlan, DispatchPlanner, FixedPoint, Geometry,
    NamedConstant, PlanInput,
};
pub use registry::{
    Family, FamilyBuilder, FamilyRegistration, KernelSource, VariantDescriptor, VariantRegistry,
    VariantSpec,
};
pub use resolver::{shared_registry, Invocation, Operator, OperatorRegistration, Resolver};
pub use schema::{ParamDef, ParamKind, ParamRole, ParameterSchema, ScalarType, ScalarValue};
pub use tensor::{Quantization, TensorInfo, TensorMeta};
