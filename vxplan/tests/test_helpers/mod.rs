//! Toy families and operators registered through `inventory` so the
//! integration tests exercise the same discovery path as operator crates.

#![allow(dead_code)]

use vxplan::{
    AttributeBag, Binding, DType, Family, FamilyBuilder, FamilyRegistration, Geometry, Invocation,
    KernelSource, KeyLayout, Operator, OperatorRegistration, ParamDef, ParameterSchema,
    PipelineTemplate, Result, ScalarSet, ScalarType, StageSpec, TensorMeta, TransientSpec,
    TypeClass, VariantSpec,
};

pub const EXP_FAMILY: &str = "toy_exp";
pub const NORM_FAMILY: &str = "toy_norm";

const EXP_SCHEMA: ParameterSchema =
    ParameterSchema::new(&[ParamDef::input("input"), ParamDef::output("output")]);

const NORM_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("input"),
    ParamDef::output("output"),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("scale", ScalarType::F32),
]);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn meta(shape: &[usize], dtype: DType) -> TensorMeta {
    TensorMeta::new(shape.to_vec(), dtype)
}

fn exp_family() -> Result<Family> {
    let layout = KeyLayout::builder().class("in").flag("image_2d", 1).build()?;
    FamilyBuilder::new(EXP_FAMILY, layout)
        .classes("in", &[TypeClass::F32, TypeClass::F16])
        .flags("image_2d", [0, 1])
        .variants(|c| {
            let suffix = if c.flag("image_2d") == 1 { "_2D" } else { "" };
            Some(VariantSpec::new(
                format!("cl.toy_exp_{}{suffix}", c.class("in")),
                KernelSource::code("toy_exp"),
                EXP_SCHEMA,
                Geometry::image(4),
            ))
        })
        .build()
}

fn norm_family() -> Result<Family> {
    let layout = KeyLayout::builder().class("in").class("out").build()?;
    FamilyBuilder::new(NORM_FAMILY, layout)
        .classes("in", &[TypeClass::F32])
        .classes("out", &[TypeClass::F32, TypeClass::F16])
        .variants(|c| {
            Some(VariantSpec::new(
                format!("cl.toy_norm_{}to{}", c.class("in"), c.class("out")),
                KernelSource::code("toy_norm"),
                NORM_SCHEMA,
                Geometry::Linear { lanes: 4 },
            ))
        })
        .build()
}

inventory::submit! { FamilyRegistration::new(EXP_FAMILY, exp_family) }
inventory::submit! { FamilyRegistration::new(NORM_FAMILY, norm_family) }

/// Exponentiate into an `f32` scratch tensor, then normalize into the output
pub struct ToySoftmax;

impl Operator for ToySoftmax {
    fn tag(&self) -> &'static str {
        "toy_softmax"
    }

    fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
        let input = inv.input(0)?;
        inv.output(0)?;
        let flat = u32::from(input.shape.len() <= 2);
        let scale = inv.attrs.float_or("scale", 1.0)?;
        Ok(vec![PipelineTemplate::new("toy_softmax")
            .transient(TransientSpec::like("exp", Binding::Input(0)).dtype(DType::F32))
            .stage(
                StageSpec::new("exp", EXP_FAMILY)
                    .input(Binding::Input(0))
                    .output(Binding::Transient(0))
                    .key([Binding::Input(0)])
                    .flags([flat]),
            )
            .stage(
                StageSpec::new("norm", NORM_FAMILY)
                    .input(Binding::Transient(0))
                    .output(Binding::Output(0))
                    .key([Binding::Transient(0), Binding::Output(0)])
                    .attrs(AttributeBag::new().with("scale", scale))
                    .scalars(|d| {
                        let width = d.inputs.first().and_then(|t| t.shape.first()).copied().unwrap_or(1);
                        Ok(ScalarSet::new()
                            .with("width", i32::try_from(width).unwrap_or(i32::MAX))
                            .with("scale", d.attrs.float("scale")? as f32))
                    }),
            )])
    }
}

static TOY_SOFTMAX: ToySoftmax = ToySoftmax;

inventory::submit! { OperatorRegistration::new(&TOY_SOFTMAX) }
