//! Dispatch planning: work-grid geometry and derived kernel constants.
//!
//! Each variant declares a [`Geometry`] rule. [`DispatchPlanner::plan`]
//! evaluates it against the bound tensors, attaches constants and checks the
//! result against the grid invariants before returning it:
//!
//! - `global_size[i] * global_scale[i] >= extent[i]` on every axis
//! - `global_size[i]` is a multiple of the declared alignment and local size

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::fmt;

use serde::Serialize;

use crate::attrs::AttributeBag;
use crate::error::{Error, Result};
use crate::registry::VariantDescriptor;
use crate::shape::{align_up, collapse_to_3d};
use crate::tensor::TensorMeta;

/// Largest right-shift the fixed-point requantization convention allows
pub const MAX_FIXED_POINT_SHIFT: u8 = 31;

/// Everything an initializer may read: the stage's bound tensors (after any
/// reshape views) and its attributes.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub inputs: &'a [TensorMeta],
    pub outputs: &'a [TensorMeta],
    pub attrs: &'a AttributeBag,
}

impl<'a> PlanInput<'a> {
    /// Shape of the first output, or an empty shape if there is none
    #[must_use]
    pub fn output_shape(&self) -> &'a [usize] {
        self.outputs.first().map_or(&[], |t| t.shape.as_slice())
    }
}

/// Custom geometry for kernels whose grid is not derived from the output
/// shape alone
pub type InitializerFn = fn(&PlanInput<'_>) -> Result<DispatchPlan>;

/// Shape- and quantization-only constants attached to a plan
pub type ConstantsFn = fn(&PlanInput<'_>) -> Result<Vec<NamedConstant>>;

/// Geometry rule recorded in a variant descriptor
#[derive(Clone, Copy)]
pub enum Geometry {
    /// 2D or 3D image grid over the collapsed output shape. Axis 0 is
    /// rounded up to `align`; with a local size, every axis is rounded to it.
    Image {
        global_scale: [usize; 3],
        align: usize,
        local: Option<[usize; 3]>,
    },
    /// 1D grid over the output element count, `lanes` elements per item.
    /// The last item handles the `n % lanes` tail.
    Linear { lanes: usize },
    /// Image grid with the extent along the axis named by `axis_attr` set to
    /// one; each work-item walks that axis.
    AxisCollapsed { axis_attr: &'static str, align: usize },
    Custom(InitializerFn),
}

impl Geometry {
    /// Plain image geometry: scale 1, axis 0 aligned to `align`
    #[must_use]
    pub const fn image(align: usize) -> Self {
        Self::Image {
            global_scale: [1, 1, 1],
            align,
            local: None,
        }
    }
}

impl fmt::Debug for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image {
                global_scale,
                align,
                local,
            } => f
                .debug_struct("Image")
                .field("global_scale", global_scale)
                .field("align", align)
                .field("local", local)
                .finish(),
            Self::Linear { lanes } => f.debug_struct("Linear").field("lanes", lanes).finish(),
            Self::AxisCollapsed { axis_attr, align } => f
                .debug_struct("AxisCollapsed")
                .field("axis_attr", axis_attr)
                .field("align", align)
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A 16-bit mantissa with a right shift: `value ≈ mantissa / 2^shift`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FixedPoint {
    pub mantissa: u16,
    pub shift: u8,
}

impl FixedPoint {
    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.mantissa) / f64::from(1u32 << self.shift)
    }
}

/// Typed constant value handed to the kernel alongside its parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConstValue {
    I32(i32),
    U32(u32),
    F32(f32),
    FixedPoint(FixedPoint),
    /// 128-bit mask or replicated value, four 32-bit lanes
    Packed([u32; 4]),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedConstant {
    pub name: &'static str,
    pub value: ConstValue,
}

impl NamedConstant {
    #[must_use]
    pub const fn new(name: &'static str, value: ConstValue) -> Self {
        Self { name, value }
    }
}

/// Work-grid geometry and auxiliary constants for one kernel dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchPlan {
    pub dim: usize,
    pub global_scale: [usize; 3],
    pub global_size: [usize; 3],
    pub local_size: Option<[usize; 3]>,
    /// Per-axis alignment `global_size` honours
    pub alignment: [usize; 3],
    /// Extents the grid must cover, after collapsing to three axes
    pub extents: [usize; 3],
    pub constants: Vec<NamedConstant>,
}

impl DispatchPlan {
    /// Grid of `dim` axes with unit scale and alignment covering `extents`
    /// exactly.
    #[must_use]
    pub fn exact(dim: usize, extents: [usize; 3]) -> Self {
        Self {
            dim,
            global_scale: [1, 1, 1],
            global_size: extents.map(|e| e.max(1)),
            local_size: None,
            alignment: [1, 1, 1],
            extents,
            constants: Vec::new(),
        }
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<ConstValue> {
        self.constants.iter().find(|c| c.name == name).map(|c| c.value)
    }

    /// Number of work-items launched
    #[must_use]
    pub fn work_items(&self) -> usize {
        self.global_size[..self.dim].iter().product()
    }

    /// Check the grid invariants.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] describing the first violated invariant
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.dim) {
            return Err(Error::internal(format!("dispatch dimension {} outside 1..=3", self.dim)));
        }
        for axis in 0..3 {
            let size = self.global_size[axis];
            let scale = self.global_scale[axis];
            if size == 0 || scale == 0 {
                return Err(Error::internal(format!("zero global size or scale on axis {axis}")));
            }
            if size * scale < self.extents[axis] {
                return Err(Error::internal(format!(
                    "axis {axis}: {size} x {scale} does not cover extent {}",
                    self.extents[axis]
                )));
            }
            if size % self.alignment[axis].max(1) != 0 {
                return Err(Error::internal(format!(
                    "axis {axis}: global size {size} is not a multiple of alignment {}",
                    self.alignment[axis]
                )));
            }
            if let Some(local) = self.local_size {
                if local[axis] == 0 || size % local[axis] != 0 {
                    return Err(Error::internal(format!(
                        "axis {axis}: global size {size} is not a multiple of local size {}",
                        local[axis]
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Evaluates geometry rules and constants for matched variants
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPlanner;

impl DispatchPlanner {
    /// Compute the dispatch plan for `variant` over the bound tensors.
    ///
    /// # Errors
    /// Propagates attribute and initializer errors; returns
    /// [`Error::Internal`] if the resulting plan breaks a grid invariant.
    pub fn plan(&self, variant: &VariantDescriptor, input: &PlanInput<'_>) -> Result<DispatchPlan> {
        let mut plan = match variant.geometry {
            Geometry::Image {
                global_scale,
                align,
                local,
            } => image_plan(collapse_to_3d(input.output_shape()), global_scale, align, local),
            Geometry::Linear { lanes } => linear_plan(input.output_shape().iter().product(), lanes),
            Geometry::AxisCollapsed { axis_attr, align } => {
                let mut extents = collapse_to_3d(input.output_shape());
                let axis = input.attrs.int(axis_attr)?;
                let axis = usize::try_from(axis)
                    .ok()
                    .filter(|&a| a < 3)
                    .ok_or_else(|| Error::ShapeConstraint(format!("axis {axis} outside [0, 3)")))?;
                extents[axis] = 1;
                image_plan(extents, [1, 1, 1], align, None)
            }
            Geometry::Custom(init) => init(input)?,
        };
        if let Some(constants) = variant.constants {
            plan.constants.extend(constants(input)?);
        }
        plan.validate().map_err(|e| {
            Error::internal(format!("{}: {e}", variant.kernel_name))
        })?;
        log::trace!(
            "{}: dim {} global {:?} scale {:?}",
            variant.kernel_name,
            plan.dim,
            plan.global_size,
            plan.global_scale
        );
        Ok(plan)
    }
}

fn image_plan(
    extents: [usize; 3],
    global_scale: [usize; 3],
    align: usize,
    local: Option<[usize; 3]>,
) -> DispatchPlan {
    let dim = if extents[2] == 1 { 2 } else { 3 };
    let mut alignment = [align.max(1), 1, 1];
    if let Some(local) = local {
        for (a, l) in alignment.iter_mut().zip(local) {
            *a = lcm(*a, l.max(1));
        }
    }
    let mut global_size = [1; 3];
    for axis in 0..3 {
        let scale = global_scale[axis].max(1);
        global_size[axis] = align_up(extents[axis].div_ceil(scale).max(1), alignment[axis]);
    }
    DispatchPlan {
        dim,
        global_scale: global_scale.map(|s| s.max(1)),
        global_size,
        local_size: local,
        alignment,
        extents,
        constants: Vec::new(),
    }
}

fn linear_plan(elements: usize, lanes: usize) -> DispatchPlan {
    let lanes = lanes.max(1);
    DispatchPlan {
        dim: 1,
        global_scale: [lanes, 1, 1],
        global_size: [elements.div_ceil(lanes).max(1), 1, 1],
        local_size: None,
        alignment: [1, 1, 1],
        extents: [elements, 1, 1],
        constants: Vec::new(),
    }
}

const fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Decompose a non-negative multiplier into a 16-bit mantissa and a right
/// shift in `0..=31`, so that `m ≈ mantissa / 2^shift`.
///
/// The mantissa is normalized into `[2^15, 2^16)` whenever the shift bound
/// allows, giving a relative error of at most `2^-16` for `m >= 2^-16`.
/// Smaller multipliers keep the maximum shift and lose mantissa bits.
///
/// # Errors
/// Returns [`Error::Internal`] for non-finite or negative multipliers and
/// for multipliers of `2^16` or more, which need a left shift.
pub fn quantize_multiplier_16bit(m: f64) -> Result<FixedPoint> {
    if !m.is_finite() || m < 0.0 {
        return Err(Error::internal(format!("cannot requantize multiplier {m}")));
    }
    if m == 0.0 {
        return Ok(FixedPoint { mantissa: 0, shift: 0 });
    }
    let mut shift = 0u8;
    let mut scaled = m;
    while scaled < 32768.0 && shift < MAX_FIXED_POINT_SHIFT {
        scaled *= 2.0;
        shift += 1;
    }
    let mut mantissa = scaled.round();
    if mantissa >= 65536.0 {
        if shift == 0 {
            return Err(Error::internal(format!(
                "multiplier {m} does not fit a 16-bit mantissa"
            )));
        }
        mantissa = (mantissa / 2.0).round();
        shift -= 1;
    }
    Ok(FixedPoint {
        mantissa: mantissa as u16,
        shift,
    })
}
