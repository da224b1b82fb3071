//! Parameter binding: ordering tensors and derived scalars by schema.
//!
//! Binding is pure. Scalars become graph resources only when a stage is
//! built, inside a [`ScalarScope`](crate::graph::ScalarScope).

use crate::attrs::AttributeBag;
use crate::error::{Error, Result};
use crate::schema::{ParamKind, ParamRole, ParameterSchema, ScalarValue};
use crate::tensor::{Quantization, TensorMeta};

/// Named scalar values produced by an operator's derivation function.
/// Schemas pick from it by name, so one derivation can serve variants with
/// different scalar lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarSet {
    values: Vec<(&'static str, ScalarValue)>,
}

impl ScalarSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; a repeated name replaces the earlier value
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<ScalarValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &'static str, value: impl Into<ScalarValue>) {
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.values.push((name, value)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ScalarValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a derivation function may read
#[derive(Debug, Clone, Copy)]
pub struct Derivation<'a> {
    pub inputs: &'a [TensorMeta],
    pub outputs: &'a [TensorMeta],
    pub attrs: &'a AttributeBag,
}

impl Derivation<'_> {
    /// Quantization of input `i`, `None` if out of range
    #[must_use]
    pub fn input_quant(&self, i: usize) -> Quantization {
        self.inputs.get(i).map_or(Quantization::None, |t| t.quantization)
    }

    /// Quantization of output `i`, `None` if out of range
    #[must_use]
    pub fn output_quant(&self, i: usize) -> Quantization {
        self.outputs.get(i).map_or(Quantization::None, |t| t.quantization)
    }
}

/// Per-operator scalar derivation
pub type DeriveFn = dyn Fn(&Derivation<'_>) -> Result<ScalarSet>;

/// One bound kernel parameter, in schema order
#[derive(Debug, PartialEq)]
pub enum ParameterSlot<'a, T> {
    Tensor(&'a T),
    Scalar(ScalarValue),
    /// Optional parameter left unset
    Absent,
}

impl<T> Clone for ParameterSlot<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ParameterSlot<'_, T> {}

impl<'a, T> ParameterSlot<'a, T> {
    #[must_use]
    pub fn tensor(&self) -> Option<&'a T> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn scalar(&self) -> Option<ScalarValue> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

/// Bind tensors and scalars in exact schema order.
///
/// Input-role slots take `inputs` in order and output-role slots take
/// `outputs` in order; scalar slots are looked up by name in `scalars`.
///
/// # Errors
/// Returns [`Error::Internal`] on any schema mismatch: too few or too many
/// tensors, a missing required scalar, or a scalar of the wrong type.
pub fn bind<'a, T>(
    schema: &ParameterSchema,
    inputs: &[&'a T],
    outputs: &[&'a T],
    scalars: &ScalarSet,
) -> Result<Vec<ParameterSlot<'a, T>>> {
    let mut inputs_left = inputs.iter();
    let mut outputs_left = outputs.iter();
    let mut slots = Vec::with_capacity(schema.len());

    for param in schema.params() {
        let slot = match (param.role, param.kind) {
            (ParamRole::Input, _) => ParameterSlot::Tensor(*inputs_left.next().ok_or_else(|| {
                Error::internal(format!("no input tensor for parameter `{}`", param.name))
            })?),
            (ParamRole::Output, _) => ParameterSlot::Tensor(*outputs_left.next().ok_or_else(|| {
                Error::internal(format!("no output tensor for parameter `{}`", param.name))
            })?),
            (ParamRole::Scalar, ParamKind::Scalar(ty)) => match scalars.get(param.name) {
                Some(value) if value.scalar_type() == ty => ParameterSlot::Scalar(value),
                Some(value) => {
                    return Err(Error::internal(format!(
                        "scalar `{}` is {:?}, schema expects {ty:?}",
                        param.name,
                        value.scalar_type()
                    )))
                }
                None if param.required => {
                    return Err(Error::internal(format!(
                        "required scalar `{}` was not derived",
                        param.name
                    )))
                }
                None => ParameterSlot::Absent,
            },
            (ParamRole::Scalar, ParamKind::Tensor) => {
                return Err(Error::internal(format!(
                    "parameter `{}` has scalar role but tensor kind",
                    param.name
                )))
            }
        };
        slots.push(slot);
    }

    let extra_inputs = inputs_left.count();
    let extra_outputs = outputs_left.count();
    if extra_inputs + extra_outputs > 0 {
        return Err(Error::internal(format!(
            "{extra_inputs} inputs and {extra_outputs} outputs left unbound"
        )));
    }
    Ok(slots)
}

/// Run `derive` over the bound tensors' metadata, then [`bind`].
///
/// # Errors
/// Propagates derivation errors and schema mismatches
pub fn bind_derived<'a>(
    schema: &ParameterSchema,
    inputs: &'a [TensorMeta],
    outputs: &'a [TensorMeta],
    attrs: &AttributeBag,
    derive: &DeriveFn,
) -> Result<Vec<ParameterSlot<'a, TensorMeta>>> {
    let scalars = derive(&Derivation {
        inputs,
        outputs,
        attrs,
    })?;
    let inputs: Vec<&TensorMeta> = inputs.iter().collect();
    let outputs: Vec<&TensorMeta> = outputs.iter().collect();
    bind(schema, &inputs, &outputs, &scalars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::schema::{ParamDef, ScalarType};

    const CLIP: ParameterSchema = ParameterSchema::new(&[
        ParamDef::input("input"),
        ParamDef::output("output"),
        ParamDef::scalar("min_value", ScalarType::F32),
        ParamDef::scalar("max_value", ScalarType::F32),
    ]);

    const QUANT: ParameterSchema = ParameterSchema::new(&[
        ParamDef::input("input"),
        ParamDef::output("output"),
        ParamDef::scalar("min_value", ScalarType::F32),
        ParamDef::scalar("max_value", ScalarType::F32),
        ParamDef::scalar("input_scale", ScalarType::F32),
        ParamDef::scalar("input_tail", ScalarType::F32),
        ParamDef::scalar("output_scale", ScalarType::F32),
        ParamDef::scalar("output_tail", ScalarType::F32),
    ]);

    fn derive(d: &Derivation<'_>) -> Result<ScalarSet> {
        let iq = d.input_quant(0);
        let oq = d.output_quant(0);
        #[allow(clippy::cast_possible_truncation)]
        let min = d.attrs.float("min_value")? as f32;
        #[allow(clippy::cast_possible_truncation)]
        let max = d.attrs.float("max_value")? as f32;
        #[allow(clippy::cast_precision_loss)]
        let out_tail = oq.zero_point() as f32;
        Ok(ScalarSet::new()
            .with("min_value", min)
            .with("max_value", max)
            .with("input_scale", iq.scale())
            .with("input_tail", iq.tail())
            .with("output_scale", 1.0 / oq.scale())
            .with("output_tail", out_tail))
    }

    fn attrs() -> AttributeBag {
        AttributeBag::new().with("min_value", -1.0).with("max_value", 6.0)
    }

    #[test]
    fn test_bind_in_schema_order() {
        let inputs = [TensorMeta::new(vec![4, 4], DType::F32)];
        let outputs = [TensorMeta::new(vec![4, 4], DType::F32)];
        let attrs = attrs();
        let slots = bind_derived(&CLIP, &inputs, &outputs, &attrs, &derive).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].tensor(), Some(&inputs[0]));
        assert_eq!(slots[1].tensor(), Some(&outputs[0]));
        assert_eq!(slots[2].scalar(), Some(ScalarValue::F32(-1.0)));
        assert_eq!(slots[3].scalar(), Some(ScalarValue::F32(6.0)));
    }

    #[test]
    fn test_bind_quantized_scalars() {
        let inputs = [TensorMeta::new(vec![4], DType::U8)
            .with_quantization(Quantization::affine(0.5, 4))];
        let outputs = [TensorMeta::new(vec![4], DType::U8)
            .with_quantization(Quantization::affine(0.25, 3))];
        let attrs = attrs();
        let slots = bind_derived(&QUANT, &inputs, &outputs, &attrs, &derive).unwrap();
        let scalars: Vec<ScalarValue> = slots.iter().filter_map(ParameterSlot::scalar).collect();
        assert_eq!(
            scalars,
            vec![
                ScalarValue::F32(-1.0),
                ScalarValue::F32(6.0),
                ScalarValue::F32(0.5),
                ScalarValue::F32(-2.0),
                ScalarValue::F32(4.0),
                ScalarValue::F32(3.0),
            ]
        );
    }

    #[test]
    fn test_missing_tensor_is_internal() {
        let a = TensorMeta::new(vec![1], DType::F32);
        let scalars = ScalarSet::new().with("min_value", 0.0f32).with("max_value", 1.0f32);
        let err = bind(&CLIP, &[&a], &[], &scalars).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_leftover_tensor_is_internal() {
        let a = TensorMeta::new(vec![1], DType::F32);
        let scalars = ScalarSet::new().with("min_value", 0.0f32).with("max_value", 1.0f32);
        let err = bind(&CLIP, &[&a, &a], &[&a], &scalars).unwrap_err();
        assert!(err.to_string().contains("1 inputs and 0 outputs left unbound"));
    }

    #[test]
    fn test_wrong_scalar_type_is_internal() {
        let a = TensorMeta::new(vec![1], DType::F32);
        let scalars = ScalarSet::new().with("min_value", 0i32).with("max_value", 1.0f32);
        assert!(bind(&CLIP, &[&a], &[&a], &scalars).is_err());
    }

    #[test]
    fn test_optional_scalar_absent() {
        const SCHEMA: ParameterSchema = ParameterSchema::new(&[
            ParamDef::output("output"),
            ParamDef::scalar("eps", ScalarType::F32).optional(),
        ]);
        let a = TensorMeta::new(vec![1], DType::F32);
        let slots = bind(&SCHEMA, &[], &[&a], &ScalarSet::new()).unwrap();
        assert_eq!(slots[1], ParameterSlot::Absent);
    }

    #[test]
    fn test_scalar_set_replaces() {
        let mut set = ScalarSet::new().with("axis", 0i32);
        set.insert("axis", 2i32);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("axis"), Some(ScalarValue::I32(2)));
    }
}
