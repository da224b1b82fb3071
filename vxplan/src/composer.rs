//! Pipeline composition: resolving and building chains of kernel stages.
//!
//! A [`PipelineTemplate`] lists transient tensors and stages. Each stage
//! binds caller tensors, reshape views and transients to its parameters.
//! [`PipelineComposer::compose`] walks the stages in order and, for each one:
//!
//! 1. looks up the stage's variant from the classes of its key tensors
//! 2. plans its dispatch and derives its scalars
//! 3. creates the transients it produces
//! 4. builds its node, releasing scalars and views right after
//! 5. releases transients whose last consumer it was
//!
//! Composition is one transaction. If any step fails, every node built and
//! every transient still held by this call is released before the error is
//! returned, so no partial pipeline stays attached to the graph.
//!
//! Single-kernel resolutions are one-stage templates without transients.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::attrs::AttributeBag;
use crate::binder::{bind, DeriveFn, Derivation, ParameterSlot, ScalarSet};
use crate::dtype::DType;
use crate::error::{Error, Result, Unsupported};
use crate::graph::{GraphBuilder, ScalarScope};
use crate::planner::{DispatchPlan, DispatchPlanner, PlanInput};
use crate::registry::{VariantDescriptor, VariantRegistry};
use crate::schema::{ParamRole, ScalarValue};
use crate::tensor::{Quantization, TensorInfo, TensorMeta};

/// Source of a tensor bound to a stage parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Input(usize),
    Output(usize),
    Transient(usize),
    /// Caller input viewed with another shape
    InputView(usize, Vec<usize>),
    /// Caller output viewed with another shape
    OutputView(usize, Vec<usize>),
}

impl Binding {
    fn transient(&self) -> Option<usize> {
        match self {
            Self::Transient(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(i) => write!(f, "in{i}"),
            Self::Output(i) => write!(f, "out{i}"),
            Self::Transient(t) => write!(f, "t{t}"),
            Self::InputView(i, shape) => write!(f, "in{i}{shape:?}"),
            Self::OutputView(i, shape) => write!(f, "out{i}{shape:?}"),
        }
    }
}

/// Transient tensor declared by a template. Attributes are inherited from
/// a caller tensor and selectively overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientSpec {
    pub name: &'static str,
    pub like: Binding,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
    pub quantization: Option<Quantization>,
}

impl TransientSpec {
    #[must_use]
    pub fn like(name: &'static str, like: Binding) -> Self {
        Self {
            name,
            like,
            dtype: None,
            shape: None,
            quantization: None,
        }
    }

    /// Override the element type, e.g. with a wider accumulation type.
    /// Quantization is dropped for float overrides unless set explicitly.
    #[must_use]
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    #[must_use]
    pub fn shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    #[must_use]
    pub fn quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = Some(quantization);
        self
    }

    fn resolve(&self, inputs: &[TensorMeta], outputs: &[TensorMeta]) -> Result<TensorMeta> {
        let mut meta = match self.like {
            Binding::Input(i) | Binding::InputView(i, _) => inputs.get(i),
            Binding::Output(i) | Binding::OutputView(i, _) => outputs.get(i),
            Binding::Transient(_) => None,
        }
        .cloned()
        .ok_or_else(|| Error::internal(format!("transient `{}` has no valid template", self.name)))?;
        if let Binding::InputView(_, shape) | Binding::OutputView(_, shape) = &self.like {
            meta.shape.clone_from(shape);
        }
        if let Some(dtype) = self.dtype {
            meta.dtype = dtype;
            if dtype.is_float() {
                meta.quantization = Quantization::None;
            }
        }
        if let Some(shape) = &self.shape {
            meta.shape.clone_from(shape);
        }
        if let Some(q) = self.quantization {
            meta.quantization = q;
        }
        Ok(meta)
    }
}

/// One kernel pass of a template
pub struct StageSpec {
    pub label: &'static str,
    pub family: &'static str,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
    /// Tensors whose classes form the key, in key-field order
    pub key_tensors: Vec<Binding>,
    pub flags: Vec<u32>,
    pub attrs: AttributeBag,
    derive: Box<DeriveFn>,
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("label", &self.label)
            .field("family", &self.family)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("key_tensors", &self.key_tensors)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl StageSpec {
    /// A stage with no bindings, no flags and no scalars
    #[must_use]
    pub fn new(label: &'static str, family: &'static str) -> Self {
        Self {
            label,
            family,
            inputs: Vec::new(),
            outputs: Vec::new(),
            key_tensors: Vec::new(),
            flags: Vec::new(),
            attrs: AttributeBag::new(),
            derive: Box::new(|_| Ok(ScalarSet::new())),
        }
    }

    #[must_use]
    pub fn input(mut self, binding: Binding) -> Self {
        self.inputs.push(binding);
        self
    }

    #[must_use]
    pub fn output(mut self, binding: Binding) -> Self {
        self.outputs.push(binding);
        self
    }

    #[must_use]
    pub fn key(mut self, tensors: impl IntoIterator<Item = Binding>) -> Self {
        self.key_tensors = tensors.into_iter().collect();
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: impl IntoIterator<Item = u32>) -> Self {
        self.flags = flags.into_iter().collect();
        self
    }

    #[must_use]
    pub fn attrs(mut self, attrs: AttributeBag) -> Self {
        self.attrs = attrs;
        self
    }

    /// Scalar derivation run over the stage's bound tensors
    #[must_use]
    pub fn scalars(mut self, derive: impl Fn(&Derivation<'_>) -> Result<ScalarSet> + 'static) -> Self {
        self.derive = Box::new(derive);
        self
    }

    fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.inputs.iter().chain(&self.outputs).chain(&self.key_tensors)
    }
}

/// Ordered stages wired through transient tensors
#[derive(Debug)]
pub struct PipelineTemplate {
    pub name: &'static str,
    pub transients: Vec<TransientSpec>,
    pub stages: Vec<StageSpec>,
}

impl PipelineTemplate {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            transients: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Single-kernel template
    #[must_use]
    pub fn single(name: &'static str, stage: StageSpec) -> Self {
        Self::new(name).stage(stage)
    }

    #[must_use]
    pub fn transient(mut self, spec: TransientSpec) -> Self {
        self.transients.push(spec);
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn is_multi_stage(&self) -> bool {
        self.stages.len() > 1
    }

    /// Structural checks: bindings in range, each transient written before
    /// it is read and read at least once.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] describing the first problem
    pub fn validate(&self, num_inputs: usize, num_outputs: usize) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::internal(format!("template `{}` has no stages", self.name)));
        }
        let in_range = |b: &Binding| match b {
            Binding::Input(i) | Binding::InputView(i, _) => *i < num_inputs,
            Binding::Output(i) | Binding::OutputView(i, _) => *i < num_outputs,
            Binding::Transient(t) => *t < self.transients.len(),
        };
        for stage in &self.stages {
            if let Some(bad) = stage.bindings().find(|b| !in_range(b)) {
                return Err(Error::internal(format!(
                    "template `{}` stage `{}` binds {bad}, which does not exist",
                    self.name, stage.label
                )));
            }
        }
        for (t, spec) in self.transients.iter().enumerate() {
            if !in_range(&spec.like) || spec.like.transient().is_some() {
                return Err(Error::internal(format!(
                    "transient `{}` must inherit from a caller tensor",
                    spec.name
                )));
            }
            let produced_at = self
                .stages
                .iter()
                .position(|s| s.outputs.contains(&Binding::Transient(t)));
            let first_read = self
                .stages
                .iter()
                .position(|s| s.inputs.contains(&Binding::Transient(t)));
            match (produced_at, first_read) {
                (Some(p), Some(r)) if p < r => {}
                (Some(_), None) => {
                    return Err(Error::internal(format!(
                        "transient `{}` is never consumed",
                        spec.name
                    )))
                }
                _ => {
                    return Err(Error::internal(format!(
                        "transient `{}` is read before it is written",
                        spec.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Index of the last stage referencing each transient
    fn last_uses(&self) -> Vec<usize> {
        (0..self.transients.len())
            .map(|t| {
                self.stages
                    .iter()
                    .rposition(|s| s.bindings().any(|b| *b == Binding::Transient(t)))
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Parameter of a built stage, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SlotSummary {
    Tensor { name: &'static str, binding: Binding },
    Scalar { name: &'static str, value: ScalarValue },
    Absent { name: &'static str },
}

impl SlotSummary {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tensor { name, .. } | Self::Scalar { name, .. } | Self::Absent { name } => name,
        }
    }
}

/// A stage whose variant, plan and scalars are resolved but whose node is
/// not attached yet
#[derive(Debug)]
pub struct UnbuiltStage {
    pub label: &'static str,
    pub variant: Arc<VariantDescriptor>,
    pub dispatch: DispatchPlan,
    pub scalars: ScalarSet,
}

impl UnbuiltStage {
    fn build<G: GraphBuilder>(self, node: G::Node, slots: Vec<SlotSummary>, spec: &StageSpec) -> PipelineStage<G> {
        PipelineStage {
            label: self.label,
            variant: self.variant,
            dispatch: self.dispatch,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            slots,
            node,
        }
    }
}

/// A stage attached to the graph
pub struct PipelineStage<G: GraphBuilder> {
    pub label: &'static str,
    pub variant: Arc<VariantDescriptor>,
    pub dispatch: DispatchPlan,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
    pub slots: Vec<SlotSummary>,
    pub node: G::Node,
}

impl<G: GraphBuilder> fmt::Debug for PipelineStage<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("label", &self.label)
            .field("kernel", &self.variant.kernel_name)
            .field("dispatch", &self.dispatch)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// Transient created and released during composition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransientRecord {
    pub name: &'static str,
    pub meta: TensorMeta,
    /// Stages writing the transient
    pub producers: Vec<usize>,
    /// Stages reading the transient
    pub consumers: Vec<usize>,
}

/// Result of a successful resolution
pub struct ExecutionPlan<G: GraphBuilder> {
    pub op: String,
    /// Name of the template that produced the plan
    pub strategy: &'static str,
    pub stages: Vec<PipelineStage<G>>,
    pub transients: Vec<TransientRecord>,
}

impl<G: GraphBuilder> ExecutionPlan<G> {
    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        self.stages.len() > 1
    }

    #[must_use]
    pub fn kernel_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.variant.kernel_name.as_str()).collect()
    }

    #[must_use]
    pub fn stage_labels(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.label).collect()
    }
}

impl<G: GraphBuilder> fmt::Debug for ExecutionPlan<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("op", &self.op)
            .field("strategy", &self.strategy)
            .field("stages", &self.stages)
            .field("transients", &self.transients)
            .finish()
    }
}

/// Resources acquired by one `compose` call. Dropping an uncommitted
/// transaction releases every node and transient it still holds.
struct Transaction<'g, G: GraphBuilder> {
    graph: &'g mut G,
    transients: Vec<Option<G::Tensor>>,
    nodes: Vec<G::Node>,
    committed: bool,
}

impl<'g, G: GraphBuilder> Transaction<'g, G> {
    fn new(graph: &'g mut G, transients: usize) -> Self {
        Self {
            graph,
            transients: (0..transients).map(|_| None).collect(),
            nodes: Vec::new(),
            committed: false,
        }
    }

    fn ensure_transient(&mut self, t: usize, meta: &TensorMeta) -> Result<()> {
        if self.transients[t].is_none() {
            self.transients[t] = Some(self.graph.create_transient(meta)?);
        }
        Ok(())
    }

    fn release_transient(&mut self, t: usize) {
        if let Some(tensor) = self.transients[t].take() {
            self.graph.release_tensor(tensor);
        }
    }

    fn build_stage(
        &mut self,
        spec: &StageSpec,
        stage: &UnbuiltStage,
        inputs: &[G::Tensor],
        outputs: &[G::Tensor],
    ) -> Result<(G::Node, Vec<SlotSummary>)> {
        let mut scope = ScalarScope::new(&mut *self.graph);
        let transients = &self.transients;
        let mut handle = |binding: &Binding| -> Result<G::Tensor> {
            match binding {
                Binding::Input(i) => Ok(inputs[*i].clone()),
                Binding::Output(i) => Ok(outputs[*i].clone()),
                Binding::InputView(i, shape) => scope.view(&inputs[*i], shape),
                Binding::OutputView(i, shape) => scope.view(&outputs[*i], shape),
                Binding::Transient(t) => transients[*t]
                    .clone()
                    .ok_or_else(|| Error::internal(format!("transient t{t} is not live"))),
            }
        };
        let bound_inputs = spec.inputs.iter().map(&mut handle).collect::<Result<Vec<_>>>()?;
        let bound_outputs = spec.outputs.iter().map(&mut handle).collect::<Result<Vec<_>>>()?;
        let input_refs: Vec<&G::Tensor> = bound_inputs.iter().collect();
        let output_refs: Vec<&G::Tensor> = bound_outputs.iter().collect();

        let slots = bind(&stage.variant.schema, &input_refs, &output_refs, &stage.scalars)?;
        let summary = summarize(spec, stage, &slots);
        let node = scope.build_node(&stage.variant, &stage.dispatch, &slots)?;
        drop(scope);
        self.nodes.push(node.clone());
        Ok((node, summary))
    }

    fn commit(mut self) {
        for t in 0..self.transients.len() {
            self.release_transient(t);
        }
        self.committed = true;
    }
}

impl<G: GraphBuilder> Drop for Transaction<'_, G> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let live = self.transients.iter().filter(|t| t.is_some()).count();
        if !self.nodes.is_empty() || live > 0 {
            log::debug!(
                "rolling back {} nodes and {live} transients",
                self.nodes.len()
            );
        }
        while let Some(node) = self.nodes.pop() {
            self.graph.release_node(node);
        }
        for t in 0..self.transients.len() {
            self.release_transient(t);
        }
    }
}

fn summarize<T>(spec: &StageSpec, stage: &UnbuiltStage, slots: &[ParameterSlot<'_, T>]) -> Vec<SlotSummary> {
    let mut inputs = spec.inputs.iter();
    let mut outputs = spec.outputs.iter();
    stage
        .variant
        .schema
        .params()
        .iter()
        .zip(slots)
        .map(|(param, slot)| match (param.role, slot) {
            (ParamRole::Input, _) => SlotSummary::Tensor {
                name: param.name,
                binding: inputs.next().cloned().unwrap_or(Binding::Input(0)),
            },
            (ParamRole::Output, _) => SlotSummary::Tensor {
                name: param.name,
                binding: outputs.next().cloned().unwrap_or(Binding::Output(0)),
            },
            (ParamRole::Scalar, ParameterSlot::Scalar(value)) => SlotSummary::Scalar {
                name: param.name,
                value: *value,
            },
            (ParamRole::Scalar, _) => SlotSummary::Absent { name: param.name },
        })
        .collect()
}

/// Resolves and builds pipeline templates against a registry
#[derive(Debug, Clone, Copy)]
pub struct PipelineComposer<'r> {
    registry: &'r VariantRegistry,
    planner: DispatchPlanner,
}

impl<'r> PipelineComposer<'r> {
    #[must_use]
    pub fn new(registry: &'r VariantRegistry) -> Self {
        Self {
            registry,
            planner: DispatchPlanner,
        }
    }

    /// Resolve every stage of `template` and attach it to `graph`.
    ///
    /// # Errors
    /// - [`Error::NotSupported`] if a stage has no matching variant
    /// - [`Error::Internal`] for malformed templates and schema mismatches
    /// - any error raised by the graph, planner or scalar derivation
    ///
    /// On error nothing created by this call remains attached or live.
    pub fn compose<G: GraphBuilder>(
        &self,
        graph: &mut G,
        template: &PipelineTemplate,
        inputs: &[G::Tensor],
        outputs: &[G::Tensor],
    ) -> Result<ExecutionPlan<G>> {
        template.validate(inputs.len(), outputs.len())?;
        let input_metas: Vec<TensorMeta> = inputs.iter().map(TensorInfo::meta).collect();
        let output_metas: Vec<TensorMeta> = outputs.iter().map(TensorInfo::meta).collect();
        let transient_metas = template
            .transients
            .iter()
            .map(|t| t.resolve(&input_metas, &output_metas))
            .collect::<Result<Vec<_>>>()?;
        let meta_of = |binding: &Binding| -> Result<TensorMeta> {
            match binding {
                Binding::Input(i) => Ok(input_metas[*i].clone()),
                Binding::Output(i) => Ok(output_metas[*i].clone()),
                Binding::Transient(t) => Ok(transient_metas[*t].clone()),
                Binding::InputView(i, shape) => view_meta(&input_metas[*i], shape),
                Binding::OutputView(i, shape) => view_meta(&output_metas[*i], shape),
            }
        };
        let last_uses = template.last_uses();

        let mut tx = Transaction::new(graph, template.transients.len());
        let mut stages = Vec::with_capacity(template.stages.len());
        for (k, spec) in template.stages.iter().enumerate() {
            let stage_inputs = spec.inputs.iter().map(&meta_of).collect::<Result<Vec<_>>>()?;
            let stage_outputs = spec.outputs.iter().map(&meta_of).collect::<Result<Vec<_>>>()?;
            let key_dtypes = spec
                .key_tensors
                .iter()
                .map(|b| meta_of(b).map(|m| m.dtype))
                .collect::<Result<Vec<_>>>()?;

            let variant = self.select(template, spec, &key_dtypes)?;
            let dispatch = self.planner.plan(
                &variant,
                &PlanInput {
                    inputs: &stage_inputs,
                    outputs: &stage_outputs,
                    attrs: &spec.attrs,
                },
            )?;
            let scalars = (spec.derive)(&Derivation {
                inputs: &stage_inputs,
                outputs: &stage_outputs,
                attrs: &spec.attrs,
            })?;
            let unbuilt = UnbuiltStage {
                label: spec.label,
                variant,
                dispatch,
                scalars,
            };

            for t in spec.outputs.iter().filter_map(Binding::transient) {
                tx.ensure_transient(t, &transient_metas[t])?;
            }
            let (node, slots) = tx.build_stage(spec, &unbuilt, inputs, outputs)?;
            log::debug!(
                "{}: stage {k} `{}` built with `{}`",
                template.name,
                spec.label,
                unbuilt.variant.kernel_name
            );
            stages.push(unbuilt.build::<G>(node, slots, spec));

            for (t, &last) in last_uses.iter().enumerate() {
                if last == k {
                    tx.release_transient(t);
                }
            }
        }
        tx.commit();

        let transients = template
            .transients
            .iter()
            .zip(transient_metas)
            .enumerate()
            .map(|(t, (spec, meta))| TransientRecord {
                name: spec.name,
                meta,
                producers: stage_indices(template, |s| s.outputs.contains(&Binding::Transient(t))),
                consumers: stage_indices(template, |s| s.inputs.contains(&Binding::Transient(t))),
            })
            .collect();
        Ok(ExecutionPlan {
            op: template.name.to_string(),
            strategy: template.name,
            stages,
            transients,
        })
    }

    fn select(
        &self,
        template: &PipelineTemplate,
        spec: &StageSpec,
        key_dtypes: &[DType],
    ) -> Result<Arc<VariantDescriptor>> {
        let not_found = || -> Error {
            Unsupported::new(template.name)
                .with_detail(format!(
                    "stage `{}`: no `{}` variant for {key_dtypes:?} flags {:?}",
                    spec.label, spec.family, spec.flags
                ))
                .into()
        };
        let family = self.registry.family(spec.family).ok_or_else(not_found)?;
        family.select(key_dtypes, &spec.flags)?.ok_or_else(not_found)
    }
}

fn view_meta(meta: &TensorMeta, shape: &[usize]) -> Result<TensorMeta> {
    if shape.iter().product::<usize>() != meta.numel() {
        return Err(Error::internal(format!(
            "cannot view {:?} as {shape:?}",
            meta.shape
        )));
    }
    Ok(TensorMeta {
        shape: shape.to_vec(),
        ..meta.clone()
    })
}

fn stage_indices(template: &PipelineTemplate, pred: impl Fn(&StageSpec) -> bool) -> Vec<usize> {
    template
        .stages
        .iter()
        .enumerate()
        .filter(|(_, s)| pred(s))
        .map(|(i, _)| i)
        .collect()
}
