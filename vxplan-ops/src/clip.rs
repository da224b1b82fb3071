//! Clip: clamp every element to `[min_value, max_value]`.
//!
//! Float variants take four parameters. When either side is U8 the kernel
//! also requantizes and takes the input and output scale/tail.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use half::{bf16, f16};

use vxplan::shape::{check_image_shape, is_image_2d};
use vxplan::{
    splat_packed, Binding, ConstValue, DType, Derivation, Error, Family, FamilyBuilder,
    FamilyRegistration, FoldingTable, Geometry, Invocation, KernelSource, KeyLayout,
    NamedConstant, Operator, OperatorRegistration, ParamDef, ParameterSchema, PipelineTemplate,
    PlanInput, Quantization, Result, ScalarSet, ScalarType, StageSpec, TypeClass, VariantSpec,
};

pub const FAMILY: &str = "clip";

const SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("input"),
    ParamDef::output("output"),
    ParamDef::scalar("min_value", ScalarType::F32),
    ParamDef::scalar("max_value", ScalarType::F32),
]);

const QUANT_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("input"),
    ParamDef::output("output"),
    ParamDef::scalar("min_value", ScalarType::F32),
    ParamDef::scalar("max_value", ScalarType::F32),
    ParamDef::scalar("input_scale", ScalarType::F32),
    ParamDef::scalar("input_tail", ScalarType::F32),
    ParamDef::scalar("output_scale", ScalarType::F32),
    ParamDef::scalar("output_tail", ScalarType::F32),
]);

/// `(in, out)` class pairs with a kernel, each in 3D and 2D form
const PAIRS: [(TypeClass, TypeClass); 5] = [
    (TypeClass::F32, TypeClass::F32),
    (TypeClass::F32, TypeClass::U8),
    (TypeClass::U8, TypeClass::U8),
    (TypeClass::U8, TypeClass::F32),
    (TypeClass::BF16, TypeClass::BF16),
];

pub fn family() -> Result<Family> {
    let layout = KeyLayout::builder()
        .class_at("in", 20, 4)
        .class_at("out", 8, 4)
        .flag_at("image_2d", 0, 1)
        .build()?;
    FamilyBuilder::new(FAMILY, layout)
        .folding(FoldingTable::closed(&[DType::F32, DType::U8, DType::BF16]).fold(DType::F16, DType::F32))
        .classes("in", &[TypeClass::F32, TypeClass::U8, TypeClass::BF16])
        .classes("out", &[TypeClass::F32, TypeClass::U8, TypeClass::BF16])
        .flags("image_2d", [0, 1])
        .exclude(|c| !PAIRS.contains(&(c.class("in"), c.class("out"))))
        .variants(|c| {
            let (input, output) = (c.class("in"), c.class("out"));
            let suffix = if c.flag("image_2d") == 1 { "_2D" } else { "" };
            let quantized = input == TypeClass::U8 || output == TypeClass::U8;
            Some(
                VariantSpec::new(
                    format!("cl.clip_{input}to{output}{suffix}"),
                    KernelSource::code(format!("clip_{input}")),
                    if quantized { QUANT_SCHEMA } else { SCHEMA },
                    Geometry::image(4),
                )
                .with_constants(packed_bounds),
            )
        })
        .build()
}

inventory::submit! { FamilyRegistration::new(FAMILY, family) }

/// Bounds replicated across a 128-bit register in the output's storage
/// format, for vectorized clamping
fn packed_bounds(input: &PlanInput<'_>) -> Result<Vec<NamedConstant>> {
    let Some(output) = input.outputs.first() else {
        return Ok(Vec::new());
    };
    let min = input.attrs.float("min_value")? as f32;
    let max = input.attrs.float("max_value")? as f32;
    let pack = |v: f32| match output.dtype {
        DType::U8 => splat_packed(quantize_u8(v, output.quantization)),
        DType::F16 => splat_packed(f16::from_f32(v)),
        DType::BF16 => splat_packed(bf16::from_f32(v)),
        _ => splat_packed(v),
    };
    Ok(vec![
        NamedConstant::new("packed_min", ConstValue::Packed(pack(min))),
        NamedConstant::new("packed_max", ConstValue::Packed(pack(max))),
    ])
}

fn quantize_u8(v: f32, q: Quantization) -> u8 {
    (v / q.scale() + q.zero_point() as f32).round().clamp(0.0, 255.0) as u8
}

fn derive(d: &Derivation<'_>) -> Result<ScalarSet> {
    let iq = d.input_quant(0);
    let oq = d.output_quant(0);
    Ok(ScalarSet::new()
        .with("min_value", d.attrs.float("min_value")? as f32)
        .with("max_value", d.attrs.float("max_value")? as f32)
        .with("input_scale", iq.scale())
        .with("input_tail", iq.tail())
        .with("output_scale", 1.0 / oq.scale())
        .with("output_tail", oq.zero_point() as f32))
}

pub struct Clip;

impl Clip {
    fn template(name: &'static str, image_2d: bool) -> PipelineTemplate {
        PipelineTemplate::single(
            name,
            StageSpec::new("clip", FAMILY)
                .input(Binding::Input(0))
                .output(Binding::Output(0))
                .key([Binding::Input(0), Binding::Output(0)])
                .flags([u32::from(image_2d)])
                .scalars(derive),
        )
    }
}

impl Operator for Clip {
    fn tag(&self) -> &'static str {
        "clip"
    }

    fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
        let input = inv.input(0)?;
        inv.output(0)?;
        check_image_shape(&input.shape, inv.config.max_image_width)?;
        let min = inv.attrs.float("min_value")?;
        let max = inv.attrs.float("max_value")?;
        if min > max {
            return Err(Error::InvalidAttribute {
                name: "min_value".into(),
                reason: format!("{min} is greater than max_value {max}"),
            });
        }

        let mut strategies = Vec::with_capacity(2);
        if is_image_2d(&input.shape) {
            strategies.push(Self::template("clip_2d", true));
        }
        strategies.push(Self::template("clip", false));
        Ok(strategies)
    }
}

inventory::submit! { OperatorRegistration::new(&Clip) }
