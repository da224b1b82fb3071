//! Cumulative sum along one axis.
//!
//! The tensor is viewed as `[inner, axis_extent, outer]` (unit extents
//! dropped) so one kernel per collapsed axis covers every rank. Each
//! work-item walks the whole axis, so the grid has extent 1 along it.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use vxplan::shape::{check_image_shape, collapse_around_axis, normalize_axis};
use vxplan::{
    quantize_multiplier_16bit, AttributeBag, Binding, ConstValue, DType, Derivation, Error, Family,
    FamilyBuilder, FamilyRegistration, FoldingTable, Geometry, Invocation, KernelSource, KeyLayout,
    NamedConstant, Operator, OperatorRegistration, ParamDef, ParameterSchema, PipelineTemplate,
    PlanInput, Result, ScalarSet, ScalarType, StageSpec, TypeClass, VariantSpec,
};

pub const FAMILY: &str = "cumsum";

const SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("input"),
    ParamDef::output("output"),
    ParamDef::scalar("axis", ScalarType::I32),
    ParamDef::scalar("exclusive", ScalarType::I32),
    ParamDef::scalar("reverse", ScalarType::I32),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("height", ScalarType::I32),
    ParamDef::scalar("channel", ScalarType::I32),
    ParamDef::scalar("input_zp", ScalarType::I32),
    ParamDef::scalar("in_out_scale", ScalarType::F32),
    ParamDef::scalar("in_out_zp_scale", ScalarType::F32),
    ParamDef::scalar("output_zp", ScalarType::F32),
]);

const PAIRS: [(TypeClass, TypeClass); 3] = [
    (TypeClass::U8, TypeClass::U8),
    (TypeClass::F32, TypeClass::F32),
    (TypeClass::F32, TypeClass::U8),
];

pub fn family() -> Result<Family> {
    let layout = KeyLayout::builder()
        .flag_at("axis", 20, 2)
        .class_at("in", 12, 8)
        .class_at("out", 4, 8)
        .flag_at("image_2d", 0, 1)
        .build()?;
    let folding = FoldingTable::closed(&[DType::U8, DType::F32])
        .fold(DType::F16, DType::F32)
        .fold(DType::U32, DType::U8);
    FamilyBuilder::new(FAMILY, layout)
        .folding(folding)
        .flags("axis", [0, 1, 2])
        .classes("in", &[TypeClass::U8, TypeClass::F32])
        .classes("out", &[TypeClass::U8, TypeClass::F32])
        .flags("image_2d", [0, 1])
        .exclude(|c| !PAIRS.contains(&(c.class("in"), c.class("out"))))
        // a 2D view has no third axis
        .exclude(|c| c.flag("image_2d") == 1 && c.flag("axis") == 2)
        .variants(|c| {
            let image_2d = c.flag("image_2d") == 1;
            let (suffix, source) = if image_2d { ("_2D", "cumsum_2d") } else { ("", "cumsum") };
            Some(
                VariantSpec::new(
                    format!(
                        "cl.cumsum_{}to{}_axis{}{suffix}",
                        c.class("in"),
                        c.class("out"),
                        c.flag("axis")
                    ),
                    KernelSource::code(source),
                    SCHEMA,
                    Geometry::AxisCollapsed {
                        axis_attr: "axis",
                        align: 1,
                    },
                )
                .with_constants(requant_multiplier),
            )
        })
        .build()
}

inventory::submit! { FamilyRegistration::new(FAMILY, family) }

/// Fixed-point input-to-output rescale for quantized outputs
fn requant_multiplier(input: &PlanInput<'_>) -> Result<Vec<NamedConstant>> {
    let (Some(src), Some(dst)) = (input.inputs.first(), input.outputs.first()) else {
        return Ok(Vec::new());
    };
    if !dst.quantization.is_quantized() {
        return Ok(Vec::new());
    }
    let m = f64::from(src.quantization.scale()) / f64::from(dst.quantization.scale());
    Ok(vec![NamedConstant::new(
        "in_out_multiplier",
        ConstValue::FixedPoint(quantize_multiplier_16bit(m)?),
    )])
}

fn as_i32(name: &str, v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::ShapeConstraint(format!("{name} {v} overflows i32")))
}

fn derive(d: &Derivation<'_>) -> Result<ScalarSet> {
    let shape = d.inputs.first().map_or(&[][..], |t| t.shape.as_slice());
    let extent = |i: usize| shape.get(i).copied().unwrap_or(1);
    let iq = d.input_quant(0);
    let oq = d.output_quant(0);
    let in_out_scale = iq.scale() / oq.scale();
    let axis = i32::try_from(d.attrs.int("axis")?).map_err(|_| Error::InvalidAttribute {
        name: "axis".into(),
        reason: "out of range".into(),
    })?;
    Ok(ScalarSet::new()
        .with("axis", axis)
        .with("exclusive", i32::from(d.attrs.bool_or("exclusive", false)?))
        .with("reverse", i32::from(d.attrs.bool_or("reverse", false)?))
        .with("width", as_i32("width", extent(0))?)
        .with("height", as_i32("height", extent(1))?)
        .with("channel", as_i32("channel", extent(2))?)
        .with("input_zp", iq.zero_point())
        .with("in_out_scale", in_out_scale)
        .with("in_out_zp_scale", in_out_scale * iq.zero_point() as f32)
        .with("output_zp", oq.zero_point() as f32))
}

pub struct Cumsum;

impl Operator for Cumsum {
    fn tag(&self) -> &'static str {
        "cumsum"
    }

    fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
        let input = inv.input(0)?;
        inv.output(0)?;
        let axis = normalize_axis(inv.attrs.int("axis")?, input.shape.len())?;
        let exclusive = inv.attrs.bool_or("exclusive", false)?;
        let reverse = inv.attrs.bool_or("reverse", false)?;

        let collapsed = collapse_around_axis(&input.shape, axis, inv.config.max_image_width)?;
        check_image_shape(&collapsed.shape, inv.config.max_image_width)?;
        log::trace!(
            "cumsum: {:?} axis {axis} viewed as {:?} axis {}",
            input.shape,
            collapsed.shape,
            collapsed.axis
        );

        let new_axis = collapsed.axis as u32;
        let view = collapsed.shape.clone();
        Ok(vec![PipelineTemplate::single(
            "cumsum",
            StageSpec::new("cumsum", FAMILY)
                .input(Binding::InputView(0, view.clone()))
                .output(Binding::OutputView(0, view))
                .key([Binding::Input(0), Binding::Output(0)])
                .flags([new_axis, u32::from(collapsed.is_2d())])
                .attrs(
                    AttributeBag::new()
                        .with("axis", i64::from(new_axis))
                        .with("exclusive", exclusive)
                        .with("reverse", reverse),
                )
                .scalars(derive),
        )])
    }
}

inventory::submit! { OperatorRegistration::new(&Cumsum) }

#[cfg(test)]
mod tests {
    use super::*;
    use vxplan::{Quantization, ResolverConfig, ScalarValue, TensorMeta};

    fn strategies(shape: &[usize], axis: i64) -> Result<Vec<PipelineTemplate>> {
        let inputs = [TensorMeta::new(shape.to_vec(), DType::F32)];
        let attrs = AttributeBag::new().with("axis", axis);
        let config = ResolverConfig::default();
        Cumsum.strategies(&Invocation {
            op: "cumsum",
            inputs: &inputs,
            outputs: &inputs,
            attrs: &attrs,
            config: &config,
        })
    }

    #[test]
    fn test_family_shape() {
        let family = family().unwrap();
        assert_eq!(family.variants().len(), 15);
        assert!(family
            .variants()
            .iter()
            .all(|v| !v.kernel_name.ends_with("_axis2_2D")));
    }

    #[test]
    fn test_key_matches_legacy_packing() {
        let family = family().unwrap();
        let key = family.key_for(&[DType::U8, DType::U8], &[1, 1]).unwrap().unwrap();
        let u8_code = u64::from(TypeClass::U8.code());
        assert_eq!(key.raw(), (1 << 20) | (u8_code << 12) | (u8_code << 4) | 1);
    }

    #[test]
    fn test_u32_and_f16_fold() {
        let family = family().unwrap();
        let v = family.select(&[DType::U32, DType::U32], &[0, 0]).unwrap().unwrap();
        assert_eq!(v.kernel_name, "cl.cumsum_U8toU8_axis0");
        let v = family.select(&[DType::F16, DType::U8], &[2, 0]).unwrap().unwrap();
        assert_eq!(v.kernel_name, "cl.cumsum_F32toU8_axis2");
        assert!(family.select(&[DType::U8, DType::F32], &[0, 0]).unwrap().is_none());
    }

    #[test]
    fn test_views_collapse_around_axis() {
        let templates = strategies(&[4, 5, 6, 2], 2).unwrap();
        let stage = &templates[0].stages[0];
        assert_eq!(stage.inputs[0], Binding::InputView(0, vec![20, 6, 2]));
        assert_eq!(stage.flags, vec![1, 0]);
        assert_eq!(stage.attrs.int("axis").unwrap(), 1);

        let templates = strategies(&[8, 3], 0).unwrap();
        let stage = &templates[0].stages[0];
        assert_eq!(stage.outputs[0], Binding::OutputView(0, vec![8, 3]));
        assert_eq!(stage.flags, vec![0, 1]);
    }

    #[test]
    fn test_axis_out_of_range() {
        assert!(matches!(strategies(&[4, 4], 2), Err(Error::ShapeConstraint(_))));
        assert!(matches!(strategies(&[4, 4], -1), Err(Error::ShapeConstraint(_))));
    }

    #[test]
    fn test_quantized_scalars() {
        let inputs = [TensorMeta::new(vec![8, 3, 2], DType::U8).with_quantization(Quantization::affine(0.5, 4))];
        let outputs = [TensorMeta::new(vec![8, 3, 2], DType::U8).with_quantization(Quantization::affine(0.25, 2))];
        let attrs = AttributeBag::new().with("axis", 1i64).with("reverse", true);
        let scalars = derive(&Derivation {
            inputs: &inputs,
            outputs: &outputs,
            attrs: &attrs,
        })
        .unwrap();
        assert_eq!(scalars.len(), 10);
        assert_eq!(scalars.get("reverse"), Some(ScalarValue::I32(1)));
        assert_eq!(scalars.get("exclusive"), Some(ScalarValue::I32(0)));
        assert_eq!(scalars.get("channel"), Some(ScalarValue::I32(2)));
        assert_eq!(scalars.get("in_out_scale"), Some(ScalarValue::F32(2.0)));
        assert_eq!(scalars.get("in_out_zp_scale"), Some(ScalarValue::F32(8.0)));
        assert_eq!(scalars.get("output_zp"), Some(ScalarValue::F32(2.0)));

        let plan_input = PlanInput {
            inputs: &inputs,
            outputs: &outputs,
            attrs: &attrs,
        };
        let constants = requant_multiplier(&plan_input).unwrap();
        let ConstValue::FixedPoint(fp) = constants[0].value else {
            panic!("expected a fixed-point multiplier");
        };
        assert!((fp.to_f64() - 2.0).abs() < 1e-4);
    }
}
