//! Bucketize: index of the bucket each input element falls into, given a
//! sorted 1D boundaries tensor. `right` selects whether a value equal to a
//! boundary belongs to the left or the right bucket.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use vxplan::shape::{check_image_shape, is_image_2d};
use vxplan::{
    Binding, DType, Derivation, Error, Family, FamilyBuilder, FamilyRegistration, FoldingTable,
    Geometry, Invocation, KernelSource, KeyLayout, Operator, OperatorRegistration, ParamDef,
    ParameterSchema, PipelineTemplate, Result, ScalarSet, ScalarType, StageSpec, TensorInfo,
    TypeClass, VariantSpec,
};

pub const FAMILY: &str = "bucketize";

const SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("input"),
    ParamDef::input("boundaries"),
    ParamDef::output("output"),
    ParamDef::scalar("boundaries_size", ScalarType::I32),
    ParamDef::scalar("input0_scale", ScalarType::F32),
    ParamDef::scalar("input0_tail", ScalarType::F32),
    ParamDef::scalar("input1_scale", ScalarType::F32),
    ParamDef::scalar("input1_tail", ScalarType::F32),
]);

const INPUT_CLASSES: [TypeClass; 4] = [TypeClass::F32, TypeClass::I32, TypeClass::U32, TypeClass::BF16];

pub fn family() -> Result<Family> {
    let layout = KeyLayout::builder()
        .class_at("in0", 0, 8)
        .class_at("in1", 8, 8)
        .class_at("out", 16, 8)
        .flag_at("right", 24, 1)
        .flag_at("image_2d", 25, 1)
        .build()?;
    let folding = FoldingTable::closed(&[DType::F32, DType::I32, DType::U32, DType::BF16])
        .fold(DType::F16, DType::F32)
        .fold_all(&[DType::I8, DType::I16], DType::I32)
        .fold_all(&[DType::U8, DType::U16], DType::U32);
    FamilyBuilder::new(FAMILY, layout)
        .folding(folding)
        .classes("in0", &INPUT_CLASSES)
        .classes("in1", &INPUT_CLASSES)
        .classes("out", &[TypeClass::I32])
        .flags("right", [0, 1])
        .flags("image_2d", [0, 1])
        .exclude(|c| c.class("in0") != c.class("in1"))
        .variants(|c| {
            let right = if c.flag("right") == 1 { "_right" } else { "" };
            let suffix = if c.flag("image_2d") == 1 { "_2D" } else { "" };
            Some(VariantSpec::new(
                format!(
                    "cl.bucketize{right}_{}_{}to{}{suffix}",
                    c.class("in0"),
                    c.class("in1"),
                    c.class("out")
                ),
                KernelSource::code("bucketize"),
                SCHEMA,
                Geometry::image(4),
            ))
        })
        .build()
}

inventory::submit! { FamilyRegistration::new(FAMILY, family) }

fn derive(d: &Derivation<'_>) -> Result<ScalarSet> {
    let q0 = d.input_quant(0);
    let q1 = d.input_quant(1);
    let boundaries = d.inputs.get(1).map_or(0, TensorInfo::numel);
    Ok(ScalarSet::new()
        .with("boundaries_size", i32::try_from(boundaries).unwrap_or(i32::MAX))
        .with("input0_scale", q0.scale())
        .with("input0_tail", q0.tail())
        .with("input1_scale", q1.scale())
        .with("input1_tail", q1.tail()))
}

pub struct Bucketize;

impl Bucketize {
    fn template(name: &'static str, right: bool, image_2d: bool) -> PipelineTemplate {
        PipelineTemplate::single(
            name,
            StageSpec::new("bucketize", FAMILY)
                .input(Binding::Input(0))
                .input(Binding::Input(1))
                .output(Binding::Output(0))
                .key([Binding::Input(0), Binding::Input(1), Binding::Output(0)])
                .flags([u32::from(right), u32::from(image_2d)])
                .scalars(derive),
        )
    }
}

impl Operator for Bucketize {
    fn tag(&self) -> &'static str {
        "bucketize"
    }

    fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
        let input = inv.input(0)?;
        let boundaries = inv.input(1)?;
        inv.output(0)?;
        let max_width = inv.config.max_image_width;
        check_image_shape(&input.shape, max_width)?;
        if boundaries.numel() >= max_width {
            return Err(Error::ShapeConstraint(format!(
                "{} boundaries exceed maximum width {max_width}",
                boundaries.numel()
            )));
        }
        let right = inv.attrs.bool_or("right", false)?;

        let mut strategies = Vec::with_capacity(2);
        if is_image_2d(&input.shape) {
            strategies.push(Self::template("bucketize_2d", right, true));
        }
        strategies.push(Self::template("bucketize", right, false));
        Ok(strategies)
    }
}

inventory::submit! { OperatorRegistration::new(&Bucketize) }

#[cfg(test)]
mod tests {
    use super::*;
    use vxplan::{Quantization, TensorMeta};

    #[test]
    fn test_family_shape() {
        let family = family().unwrap();
        assert_eq!(family.variants().len(), 16);
        assert!(family.variants().iter().any(|v| v.kernel_name == "cl.bucketize_right_U32_U32toI32_2D"));
    }

    #[test]
    fn test_integer_folding() {
        let family = family().unwrap();
        let v = family
            .select(&[DType::I8, DType::I16, DType::I32], &[0, 0])
            .unwrap()
            .unwrap();
        assert_eq!(v.kernel_name, "cl.bucketize_I32_I32toI32");
        let v = family
            .select(&[DType::U8, DType::U16, DType::I32], &[1, 0])
            .unwrap()
            .unwrap();
        assert_eq!(v.kernel_name, "cl.bucketize_right_U32_U32toI32");
    }

    #[test]
    fn test_mixed_inputs_not_found() {
        let family = family().unwrap();
        assert!(family
            .select(&[DType::F32, DType::I32, DType::I32], &[0, 0])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tail_uses_own_scale() {
        let inputs = [
            TensorMeta::new(vec![4], DType::U8).with_quantization(Quantization::affine(0.5, 2)),
            TensorMeta::new(vec![3], DType::U8).with_quantization(Quantization::affine(0.25, 4)),
        ];
        let outputs = [TensorMeta::new(vec![4], DType::I32)];
        let attrs = vxplan::AttributeBag::new();
        let scalars = derive(&Derivation {
            inputs: &inputs,
            outputs: &outputs,
            attrs: &attrs,
        })
        .unwrap();
        assert_eq!(scalars.get("boundaries_size"), Some(vxplan::ScalarValue::I32(3)));
        assert_eq!(scalars.get("input0_tail"), Some(vxplan::ScalarValue::F32(-1.0)));
        assert_eq!(scalars.get("input1_tail"), Some(vxplan::ScalarValue::F32(-1.0)));
    }
}
