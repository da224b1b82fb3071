//! Resolver facade: from an operator invocation to an execution plan.
//!
//! Every operator implements [`Operator`] and lists its strategies, most
//! shape-specific first. A single-kernel strategy is a one-stage
//! [`PipelineTemplate`]; a multi-pass strategy chains stages through
//! transients. The resolver tries each in order:
//!
//! - `NotSupported` from a strategy moves on to the next one
//! - any other error aborts resolution
//! - if none applies, `NotSupported` carries the invocation's dtypes and shapes

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::attrs::AttributeBag;
use crate::composer::{ExecutionPlan, PipelineComposer, PipelineTemplate};
use crate::config::ResolverConfig;
use crate::error::{Error, Result, Unsupported};
use crate::graph::GraphBuilder;
use crate::registry::{VariantRegistry, DEFAULT_HASHED_LOOKUP_THRESHOLD};
use crate::tensor::{TensorInfo, TensorMeta};

/// What an operator sees when choosing strategies
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub op: &'a str,
    pub inputs: &'a [TensorMeta],
    pub outputs: &'a [TensorMeta],
    pub attrs: &'a AttributeBag,
    pub config: &'a ResolverConfig,
}

impl Invocation<'_> {
    /// Input `i`
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the invocation has fewer inputs
    pub fn input(&self, i: usize) -> Result<&TensorMeta> {
        self.inputs.get(i).ok_or_else(|| self.arity_error())
    }

    /// Output `i`
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the invocation has fewer outputs
    pub fn output(&self, i: usize) -> Result<&TensorMeta> {
        self.outputs.get(i).ok_or_else(|| self.arity_error())
    }

    /// `NotSupported` for this invocation with a detail message
    #[must_use]
    pub fn unsupported(&self, detail: impl Into<String>) -> Error {
        Unsupported::new(self.op)
            .with_tensors(self.inputs, self.outputs)
            .with_detail(detail)
            .into()
    }

    fn arity_error(&self) -> Error {
        self.unsupported(format!(
            "unexpected arity: {} inputs, {} outputs",
            self.inputs.len(),
            self.outputs.len()
        ))
    }
}

/// A logical operator and its resolution strategies
pub trait Operator: Send + Sync {
    /// Operator tag used in invocations, e.g. `"clip"`
    fn tag(&self) -> &'static str;

    /// Candidate templates, most shape-specific first.
    ///
    /// # Errors
    /// Attribute and shape errors abort resolution; return an empty list
    /// when no strategy can apply.
    fn strategies(&self, invocation: &Invocation<'_>) -> Result<Vec<PipelineTemplate>>;
}

/// Static operator registration, collected across crates
pub struct OperatorRegistration {
    pub operator: &'static dyn Operator,
}

impl OperatorRegistration {
    #[must_use]
    pub const fn new(operator: &'static dyn Operator) -> Self {
        Self { operator }
    }
}

inventory::collect!(OperatorRegistration);

static SHARED_REGISTRY: OnceLock<std::result::Result<Arc<VariantRegistry>, String>> = OnceLock::new();

/// Process-wide registry built from `inventory` with the default lookup
/// threshold. Built on first use; a failure is reported on every call.
///
/// # Errors
/// Returns [`Error::Internal`] if registry construction failed
pub fn shared_registry() -> Result<Arc<VariantRegistry>> {
    SHARED_REGISTRY
        .get_or_init(|| {
            VariantRegistry::from_inventory(DEFAULT_HASHED_LOOKUP_THRESHOLD)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(Error::Internal)
}

/// Entry point of kernel resolution
pub struct Resolver {
    registry: Arc<VariantRegistry>,
    operators: HashMap<&'static str, &'static dyn Operator>,
    config: ResolverConfig,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.operators.keys().collect();
        ops.sort();
        f.debug_struct("Resolver")
            .field("registry", &self.registry)
            .field("operators", &ops)
            .field("config", &self.config)
            .finish()
    }
}

impl Resolver {
    /// Resolver over explicit parts.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if two operators share a tag
    pub fn new(
        registry: Arc<VariantRegistry>,
        operators: impl IntoIterator<Item = &'static dyn Operator>,
        config: ResolverConfig,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for op in operators {
            if map.insert(op.tag(), op).is_some() {
                return Err(Error::internal(format!("operator `{}` registered twice", op.tag())));
            }
        }
        Ok(Self {
            registry,
            operators: map,
            config,
        })
    }

    /// Resolver over every family and operator submitted with `inventory`.
    ///
    /// The default lookup threshold reuses the process-wide registry.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] on registration bugs
    pub fn from_inventory(config: ResolverConfig) -> Result<Self> {
        let registry = if config.hashed_lookup_threshold == DEFAULT_HASHED_LOOKUP_THRESHOLD {
            shared_registry()?
        } else {
            Arc::new(VariantRegistry::from_inventory(config.hashed_lookup_threshold)?)
        };
        let operators = inventory::iter::<OperatorRegistration>
            .into_iter()
            .map(|r| r.operator);
        Self::new(registry, operators, config)
    }

    #[must_use]
    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Registered operator tags, sorted
    #[must_use]
    pub fn operators(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.operators.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Resolve `op` over caller tensors and attach the result to `graph`.
    ///
    /// # Errors
    /// - [`Error::NotSupported`] for unknown tags or when no strategy applies
    /// - [`Error::ShapeConstraint`] and [`Error::InvalidAttribute`] from the
    ///   operator
    /// - [`Error::Internal`] and [`Error::Graph`] from composition
    pub fn resolve<G: GraphBuilder>(
        &self,
        graph: &mut G,
        op: &str,
        inputs: &[G::Tensor],
        outputs: &[G::Tensor],
        attrs: &AttributeBag,
    ) -> Result<ExecutionPlan<G>> {
        let input_metas: Vec<TensorMeta> = inputs.iter().map(TensorInfo::meta).collect();
        let output_metas: Vec<TensorMeta> = outputs.iter().map(TensorInfo::meta).collect();
        let invocation = Invocation {
            op,
            inputs: &input_metas,
            outputs: &output_metas,
            attrs,
            config: &self.config,
        };

        let Some(operator) = self.operators.get(op) else {
            let err = invocation.unsupported("unknown operator");
            log::warn!("{err}");
            return Err(err);
        };
        let strategies = operator.strategies(&invocation)?;

        let composer = PipelineComposer::new(&self.registry);
        let mut rejected = Vec::new();
        for template in &strategies {
            match composer.compose(graph, template, inputs, outputs) {
                Ok(mut plan) => {
                    log::debug!(
                        "{op}: resolved with `{}` ({} stages)",
                        template.name,
                        plan.stages.len()
                    );
                    plan.op = op.to_string();
                    return Ok(plan);
                }
                Err(Error::NotSupported(u)) => {
                    log::debug!("{op}: strategy `{}` does not apply: {u}", template.name);
                    rejected.push(template.name);
                }
                Err(e) => return Err(e),
            }
        }

        let detail = if rejected.is_empty() {
            "no applicable strategy".to_string()
        } else {
            format!("no variant for strategies {}", rejected.join(", "))
        };
        let err = invocation.unsupported(detail);
        log::warn!("{err}");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TypeClass;
    use crate::composer::{Binding, StageSpec};
    use crate::dtype::DType;
    use crate::graph::DryRunGraph;
    use crate::key::KeyLayout;
    use crate::planner::Geometry;
    use crate::registry::{FamilyBuilder, KernelSource, VariantSpec};
    use crate::schema::{ParamDef, ParameterSchema};

    const SCHEMA: ParameterSchema =
        ParameterSchema::new(&[ParamDef::input("input"), ParamDef::output("output")]);

    struct Negate;

    impl Operator for Negate {
        fn tag(&self) -> &'static str {
            "negate"
        }

        fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
            if inv.attrs.bool_or("reject", false)? {
                return Err(Error::ShapeConstraint("rejected".into()));
            }
            let stage = |family| {
                StageSpec::new("negate", family)
                    .input(Binding::Input(0))
                    .output(Binding::Output(0))
                    .key([Binding::Input(0), Binding::Output(0)])
            };
            Ok(vec![
                PipelineTemplate::single("negate_fast", stage("negate_fast")),
                PipelineTemplate::single("negate", stage("negate")),
            ])
        }
    }

    static NEGATE: Negate = Negate;

    fn family(name: &'static str, classes: &[TypeClass]) -> crate::registry::Family {
        FamilyBuilder::new(name, KeyLayout::builder().class("in").class("out").build().unwrap())
            .classes("in", classes)
            .classes("out", classes)
            .variants(move |c| {
                Some(VariantSpec::new(
                    format!("cl.{name}_{}", c.class("in")),
                    KernelSource::code(name),
                    SCHEMA,
                    Geometry::image(4),
                ))
            })
            .build()
            .unwrap()
    }

    fn resolver() -> Resolver {
        let registry = VariantRegistry::from_families([
            family("negate_fast", &[TypeClass::F32]),
            family("negate", &[TypeClass::F32, TypeClass::I32]),
        ])
        .unwrap();
        Resolver::new(Arc::new(registry), [&NEGATE as &dyn Operator], ResolverConfig::default()).unwrap()
    }

    fn run(dtype: DType, attrs: &AttributeBag) -> (DryRunGraph, Result<Vec<String>>) {
        let resolver = resolver();
        let mut graph = DryRunGraph::new();
        let a = graph.tensor(TensorMeta::new(vec![5, 3], dtype));
        let b = graph.tensor(TensorMeta::new(vec![5, 3], dtype));
        let names = resolver
            .resolve(&mut graph, "negate", &[a], &[b], attrs)
            .map(|p| p.kernel_names().iter().map(ToString::to_string).collect());
        (graph, names)
    }

    #[test]
    fn test_first_strategy_wins() {
        let (graph, names) = run(DType::F32, &AttributeBag::new());
        assert_eq!(names.unwrap(), vec!["cl.negate_fast_F32"]);
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn test_falls_back_to_next_strategy() {
        let (_, names) = run(DType::I32, &AttributeBag::new());
        assert_eq!(names.unwrap(), vec!["cl.negate_I32"]);
    }

    #[test]
    fn test_not_supported_carries_invocation() {
        let (graph, names) = run(DType::I64, &AttributeBag::new());
        let err = names.unwrap_err();
        assert!(err.is_not_supported());
        let msg = err.to_string();
        assert!(msg.contains("negate(i64[5, 3]) -> (i64[5, 3])"), "{msg}");
        assert!(msg.contains("negate_fast, negate"), "{msg}");
        assert!(graph.nodes().is_empty());
    }

    #[test]
    fn test_operator_error_aborts() {
        let (_, names) = run(DType::F32, &AttributeBag::new().with("reject", true));
        assert!(matches!(names, Err(Error::ShapeConstraint(_))));
    }

    #[test]
    fn test_unknown_operator() {
        let resolver = resolver();
        let mut graph = DryRunGraph::new();
        let err = resolver
            .resolve(&mut graph, "frobnicate", &[], &[], &AttributeBag::new())
            .unwrap_err();
        assert!(err.to_string().contains("frobnicate() -> (): unknown operator"));
    }

    #[test]
    fn test_duplicate_operator_tag() {
        let registry = Arc::new(VariantRegistry::default());
        let err = Resolver::new(registry, [&NEGATE as &dyn Operator, &NEGATE], ResolverConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_resolver_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Resolver>();
    }
}
