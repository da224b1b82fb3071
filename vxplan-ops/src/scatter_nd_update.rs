//! Scatter-ND update: write (or reduce) slices of `updates` into a copy of
//! `ref` at the coordinates listed in `indices`.
//!
//! Shapes are innermost first. `indices` is `[coord_dim, index_num]`;
//! `updates` is `[block_size, index_num]` once flattened, and `ref` is viewed
//! as `[block_size, n / block_size]`.
//!
//! Two strategies:
//!
//! - a single vectorized kernel, valid only when every coordinate is
//!   distinct and no reduction is requested, and only on EVIS devices
//! - a four-stage pipeline (`reset`, `update`, `merge`, `copy`) through
//!   float transients, which tolerates repeated coordinates and reductions

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::fmt;
use std::str::FromStr;

use vxplan::shape::align_up;
use vxplan::{
    Binding, DType, Derivation, DispatchPlan, Error, Family, FamilyBuilder, FamilyRegistration,
    FoldingTable, Geometry, Invocation, KernelSource, KeyLayout, Operator, OperatorRegistration,
    ParamDef, ParameterSchema, PipelineTemplate, PlanInput, Result, ScalarSet, ScalarType,
    StageSpec, TensorInfo, TensorMeta, TransientSpec, TypeClass, VariantSpec,
};

pub const FAMILY: &str = "scatter_nd_update";
pub const RESET_FAMILY: &str = "scatter_nd_update_reset";
pub const UPDATE_FAMILY: &str = "scatter_nd_update_update";
pub const MERGE_FAMILY: &str = "scatter_nd_update_merge";
pub const COPY_FAMILY: &str = "scatter_nd_update_copy";

/// Most coordinate components the update stage addresses
const MAX_COORD_DIM: usize = 7;
/// Most coordinate components the fast kernel addresses
const MAX_FAST_COORD_DIM: usize = 4;

const HELPER: &str = "eltwise_ops_helper";
const PIPELINE_SOURCE: &str = "scatter_nd_update_reduction";

/// Reduction applied where an update lands on an existing element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Reduction {
    /// Overwrite
    #[default]
    None,
    Add,
    Mul,
    Max,
    Min,
}

impl Reduction {
    pub const ALL: [Self; 5] = [Self::None, Self::Add, Self::Mul, Self::Max, Self::Min];

    /// Value of the `reduction` key field
    #[must_use]
    pub const fn flag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Add => 1,
            Self::Mul => 2,
            Self::Max => 3,
            Self::Min => 4,
        }
    }

    fn from_flag(flag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.flag() == flag)
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Add => "Add",
            Self::Mul => "Mul",
            Self::Max => "Max",
            Self::Min => "Min",
        })
    }
}

impl FromStr for Reduction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "add" | "sum" => Ok(Self::Add),
            "mul" | "prod" => Ok(Self::Mul),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(Error::InvalidAttribute {
                name: "reduction".into(),
                reason: format!("unknown reduction `{other}`"),
            }),
        }
    }
}

const FAST_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("ref"),
    ParamDef::input("indices"),
    ParamDef::input("updates"),
    ParamDef::output("output"),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("area", ScalarType::I32),
    ParamDef::scalar("vol", ScalarType::I32),
    ParamDef::scalar("coord_dim", ScalarType::I32),
]);

const RESET_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("ref"),
    ParamDef::output("accumulator"),
    ParamDef::output("contributions"),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("remainder", ScalarType::I32),
    ParamDef::scalar("input_scale", ScalarType::F32),
    ParamDef::scalar("input_tail", ScalarType::F32),
]);

const STRIDE_NAMES: [&str; MAX_COORD_DIM] = [
    "coord_stride0",
    "coord_stride1",
    "coord_stride2",
    "coord_stride3",
    "coord_stride4",
    "coord_stride5",
    "coord_stride6",
];

const UPDATE_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("indices"),
    ParamDef::input("updates"),
    ParamDef::output("contributions"),
    ParamDef::scalar("coord_stride0", ScalarType::I32),
    ParamDef::scalar("coord_stride1", ScalarType::I32),
    ParamDef::scalar("coord_stride2", ScalarType::I32),
    ParamDef::scalar("coord_stride3", ScalarType::I32),
    ParamDef::scalar("coord_stride4", ScalarType::I32),
    ParamDef::scalar("coord_stride5", ScalarType::I32),
    ParamDef::scalar("coord_stride6", ScalarType::I32),
    ParamDef::scalar("coord_dim", ScalarType::I32),
    ParamDef::scalar("update_width", ScalarType::I32),
    ParamDef::scalar("output_width", ScalarType::I32),
    ParamDef::scalar("update_scale", ScalarType::F32),
    ParamDef::scalar("update_tail", ScalarType::F32),
]);

const MERGE_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("accumulator"),
    ParamDef::input("contributions"),
    ParamDef::output("merged"),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("remainder", ScalarType::I32),
    ParamDef::scalar("output_scale", ScalarType::F32),
    ParamDef::scalar("output_zp", ScalarType::F32),
]);

const COPY_SCHEMA: ParameterSchema = ParameterSchema::new(&[
    ParamDef::input("merged"),
    ParamDef::output("output"),
    ParamDef::scalar("width", ScalarType::I32),
    ParamDef::scalar("remainder", ScalarType::I32),
]);

/// `(ref, update, out)` triples of the vectorized kernel
const FAST_TRIPLES: [(TypeClass, TypeClass, TypeClass); 9] = [
    (TypeClass::I8, TypeClass::I8, TypeClass::I8),
    (TypeClass::U8, TypeClass::U8, TypeClass::U8),
    (TypeClass::I16, TypeClass::I16, TypeClass::I16),
    (TypeClass::F16, TypeClass::F16, TypeClass::F16),
    (TypeClass::BF16, TypeClass::BF16, TypeClass::BF16),
    (TypeClass::U8, TypeClass::U8, TypeClass::F16),
    (TypeClass::I8, TypeClass::I8, TypeClass::F16),
    (TypeClass::I16, TypeClass::I16, TypeClass::F16),
    (TypeClass::F16, TypeClass::F16, TypeClass::U8),
];

const FAST_DTYPES: [DType; 5] = [DType::I8, DType::U8, DType::I16, DType::F16, DType::BF16];
const FAST_CLASSES: [TypeClass; 5] = [
    TypeClass::I8,
    TypeClass::U8,
    TypeClass::I16,
    TypeClass::F16,
    TypeClass::BF16,
];

/// Storage types the pipeline converts from and to float
const PIPELINE_DTYPES: [DType; 5] = [DType::U8, DType::I8, DType::I16, DType::F16, DType::F32];
const PIPELINE_CLASSES: [TypeClass; 5] = [
    TypeClass::U8,
    TypeClass::I8,
    TypeClass::I16,
    TypeClass::F16,
    TypeClass::F32,
];

pub fn fast_family() -> Result<Family> {
    let layout = KeyLayout::builder()
        .class_at("ref", 24, 8)
        .class_at("update", 16, 8)
        .class_at("out", 8, 8)
        .flag_at("caps", 0, 2)
        .build()?;
    FamilyBuilder::new(FAMILY, layout)
        .folding(FoldingTable::closed(&FAST_DTYPES))
        .classes("ref", &FAST_CLASSES)
        .classes("update", &FAST_CLASSES)
        .classes("out", &FAST_CLASSES)
        // no vectorized kernel without EVIS
        .flags("caps", [1, 2])
        .exclude(|c| !FAST_TRIPLES.contains(&(c.class("ref"), c.class("update"), c.class("out"))))
        .variants(|c| {
            Some(VariantSpec::new(
                format!(
                    "evis.scatter_nd_update_{}{}to{}",
                    c.class("ref"),
                    c.class("update"),
                    c.class("out")
                ),
                KernelSource::code("scatter_nd_update"),
                FAST_SCHEMA,
                Geometry::Custom(fast_grid),
            ))
        })
        .build()
}

pub fn reset_family() -> Result<Family> {
    FamilyBuilder::new(RESET_FAMILY, KeyLayout::builder().class("ref").build()?)
        .folding(FoldingTable::closed(&PIPELINE_DTYPES))
        .classes("ref", &PIPELINE_CLASSES)
        .variants(|c| {
            Some(VariantSpec::new(
                format!("cl.scatter_nd_update_reset_{}", c.class("ref")),
                KernelSource::code(PIPELINE_SOURCE).with_helper(HELPER),
                RESET_SCHEMA,
                Geometry::Linear { lanes: 8 },
            ))
        })
        .build()
}

pub fn update_family() -> Result<Family> {
    let layout = KeyLayout::builder().class("update").flag("reduction", 3).build()?;
    FamilyBuilder::new(UPDATE_FAMILY, layout)
        .folding(FoldingTable::closed(&PIPELINE_DTYPES))
        .classes("update", &PIPELINE_CLASSES)
        .flags("reduction", Reduction::ALL.map(Reduction::flag))
        .variants(|c| {
            let reduction = Reduction::from_flag(c.flag("reduction"))?;
            Some(VariantSpec::new(
                format!("cl.scatter_nd_update_reduction_{reduction}_{}", c.class("update")),
                KernelSource::code(PIPELINE_SOURCE).with_helper(HELPER),
                UPDATE_SCHEMA,
                Geometry::Custom(update_grid),
            ))
        })
        .build()
}

pub fn merge_family() -> Result<Family> {
    let layout = KeyLayout::builder().class("out").flag("reduction", 3).build()?;
    FamilyBuilder::new(MERGE_FAMILY, layout)
        .folding(FoldingTable::closed(&PIPELINE_DTYPES))
        .classes("out", &PIPELINE_CLASSES)
        .flags("reduction", Reduction::ALL.map(Reduction::flag))
        .variants(|c| {
            let reduction = Reduction::from_flag(c.flag("reduction"))?;
            Some(VariantSpec::new(
                format!("cl.scatter_nd_update_merge_{reduction}_{}", c.class("out")),
                KernelSource::code(format!("{PIPELINE_SOURCE}_conv")).with_helper(HELPER),
                MERGE_SCHEMA,
                Geometry::Linear { lanes: 8 },
            ))
        })
        .build()
}

pub fn copy_family() -> Result<Family> {
    FamilyBuilder::new(COPY_FAMILY, KeyLayout::builder().class("in").class("out").build()?)
        .folding(FoldingTable::closed(&PIPELINE_DTYPES))
        .classes("in", &PIPELINE_CLASSES)
        .classes("out", &PIPELINE_CLASSES)
        .exclude(|c| c.class("in") != c.class("out"))
        .variants(|c| {
            Some(VariantSpec::new(
                format!("cl.scatter_nd_update_copy_{}", c.class("out")),
                KernelSource::code(format!("{PIPELINE_SOURCE}_conv")).with_helper(HELPER),
                COPY_SCHEMA,
                Geometry::Linear { lanes: 8 },
            ))
        })
        .build()
}

inventory::submit! { FamilyRegistration::new(FAMILY, fast_family) }
inventory::submit! { FamilyRegistration::new(RESET_FAMILY, reset_family) }
inventory::submit! { FamilyRegistration::new(UPDATE_FAMILY, update_family) }
inventory::submit! { FamilyRegistration::new(MERGE_FAMILY, merge_family) }
inventory::submit! { FamilyRegistration::new(COPY_FAMILY, copy_family) }

/// Eight elements per work-item along the block, one row per index
fn fast_grid(input: &PlanInput<'_>) -> Result<DispatchPlan> {
    let [block, index_num] = updates_extents(input)?;
    Ok(DispatchPlan {
        dim: 2,
        global_scale: [8, 1, 1],
        global_size: [align_up(block.div_ceil(8).max(1), 4), index_num.max(1), 1],
        local_size: None,
        alignment: [4, 1, 1],
        extents: [block, index_num, 1],
        constants: Vec::new(),
    })
}

/// One work-item per updated element
fn update_grid(input: &PlanInput<'_>) -> Result<DispatchPlan> {
    let [block, index_num] = updates_extents(input)?;
    Ok(DispatchPlan::exact(2, [block, index_num, 1]))
}

fn updates_extents(input: &PlanInput<'_>) -> Result<[usize; 2]> {
    let updates = input
        .inputs
        .last()
        .ok_or_else(|| Error::Internal("scatter grid needs an updates tensor".into()))?;
    match updates.shape.as_slice() {
        [block, index_num] => Ok([*block, *index_num]),
        shape => Err(Error::Internal(format!("updates view {shape:?} is not 2D"))),
    }
}

fn as_i32(name: &str, v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::ShapeConstraint(format!("{name} {v} overflows i32")))
}

/// `(width, remainder)` of a linear pass: whole groups of eight, then the tail
fn linear_split(n: usize) -> Result<(i32, i32)> {
    Ok((as_i32("width", (n >> 3) << 3)?, as_i32("remainder", n % 8)?))
}

fn reset_scalars(d: &Derivation<'_>) -> Result<ScalarSet> {
    let (width, remainder) = linear_split(d.inputs.first().map_or(0, TensorInfo::numel))?;
    let q = d.input_quant(0);
    Ok(ScalarSet::new()
        .with("width", width)
        .with("remainder", remainder)
        .with("input_scale", q.scale())
        .with("input_tail", q.tail()))
}

fn merge_scalars(d: &Derivation<'_>) -> Result<ScalarSet> {
    let (width, remainder) = linear_split(d.outputs.first().map_or(0, TensorInfo::numel))?;
    let q = d.output_quant(0);
    Ok(ScalarSet::new()
        .with("width", width)
        .with("remainder", remainder)
        .with("output_scale", 1.0 / q.scale())
        .with("output_zp", q.zero_point() as f32))
}

fn copy_scalars(d: &Derivation<'_>) -> Result<ScalarSet> {
    let (width, remainder) = linear_split(d.outputs.first().map_or(0, TensorInfo::numel))?;
    Ok(ScalarSet::new().with("width", width).with("remainder", remainder))
}

/// Shape facts shared by both strategies
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScatterGeometry {
    block_size: usize,
    rows: usize,
    coord_dim: usize,
    index_num: usize,
    /// Element stride of each coordinate component, zero-padded
    coord_strides: [usize; MAX_COORD_DIM],
    /// Products of the leading indexed extents, as read by the fast kernel
    width: usize,
    area: usize,
    vol: usize,
}

impl ScatterGeometry {
    fn new(reference: &TensorMeta, indices: &TensorMeta, updates: &TensorMeta) -> Result<Self> {
        let shape = &reference.shape;
        let rank = shape.len();
        let coord_dim = indices.shape.first().copied().unwrap_or(1);
        if coord_dim == 0 || coord_dim > rank || coord_dim > MAX_COORD_DIM {
            return Err(Error::ShapeConstraint(format!(
                "coordinate size {coord_dim} outside [1, {}]",
                rank.min(MAX_COORD_DIM)
            )));
        }
        let index_num = indices.numel() / coord_dim;
        let block_size = updates.shape.first().copied().unwrap_or(1);
        let n = reference.numel();
        if block_size == 0 || n % block_size != 0 {
            return Err(Error::ShapeConstraint(format!(
                "block size {block_size} does not divide {n} reference elements"
            )));
        }
        if updates.numel() != block_size * index_num {
            return Err(Error::ShapeConstraint(format!(
                "{} update elements for {index_num} indices of block {block_size}",
                updates.numel()
            )));
        }

        let indexed = &shape[rank - coord_dim..];
        let mut strides = [0usize; MAX_COORD_DIM];
        if coord_dim >= 2 {
            strides[0] = indexed[0];
            for i in 1..coord_dim - 1 {
                strides[i] = strides[i - 1] * indexed[i];
            }
        }
        let mut coord_strides = [0usize; MAX_COORD_DIM];
        coord_strides[coord_dim - 1] = 1;
        for i in 0..coord_dim - 1 {
            coord_strides[i] = strides[coord_dim - 2 - i];
        }

        let extent = |i: usize| indexed.get(i).copied().unwrap_or(1);
        let (width, area, vol) = match coord_dim {
            1 => (0, 0, 0),
            2 => (extent(0), 0, 0),
            3 => (extent(0), extent(0) * extent(1), 0),
            _ => (
                extent(0),
                extent(0) * extent(1),
                extent(0) * extent(1) * extent(2),
            ),
        };

        Ok(Self {
            block_size,
            rows: n / block_size,
            coord_dim,
            index_num,
            coord_strides,
            width,
            area,
            vol,
        })
    }

    fn view(&self) -> Vec<usize> {
        vec![self.block_size, self.rows]
    }

    fn indices_view(&self) -> Vec<usize> {
        vec![self.coord_dim, self.index_num]
    }

    fn updates_view(&self) -> Vec<usize> {
        vec![self.block_size, self.index_num]
    }
}

pub struct ScatterNdUpdate;

impl ScatterNdUpdate {
    fn fast_path(geo: &ScatterGeometry, caps: u32) -> Result<PipelineTemplate> {
        let width = as_i32("width", geo.width)?;
        let area = as_i32("area", geo.area)?;
        let vol = as_i32("vol", geo.vol)?;
        let coord_dim = as_i32("coord_dim", geo.coord_dim)?;
        Ok(PipelineTemplate::single(
            "scatter_nd_update",
            StageSpec::new("scatter", FAMILY)
                .input(Binding::InputView(0, geo.view()))
                .input(Binding::InputView(1, geo.indices_view()))
                .input(Binding::InputView(2, geo.updates_view()))
                .output(Binding::OutputView(0, geo.view()))
                .key([Binding::Input(0), Binding::Input(2), Binding::Output(0)])
                .flags([caps])
                .scalars(move |_: &Derivation<'_>| {
                    Ok(ScalarSet::new()
                        .with("width", width)
                        .with("area", area)
                        .with("vol", vol)
                        .with("coord_dim", coord_dim))
                }),
        ))
    }

    fn pipeline(geo: &ScatterGeometry, reduction: Reduction) -> Result<PipelineTemplate> {
        let mut strides = [0i32; MAX_COORD_DIM];
        for (dst, &src) in strides.iter_mut().zip(&geo.coord_strides) {
            *dst = as_i32("coordinate stride", src)?;
        }
        let coord_dim = as_i32("coord_dim", geo.coord_dim)?;
        let update_scalars = move |d: &Derivation<'_>| -> Result<ScalarSet> {
            let mut scalars = ScalarSet::new();
            for (name, stride) in STRIDE_NAMES.into_iter().zip(strides) {
                scalars.insert(name, stride);
            }
            let update_width = d.inputs.get(1).and_then(|t| t.shape.first().copied()).unwrap_or(1);
            let output_width = d.outputs.first().and_then(|t| t.shape.first().copied()).unwrap_or(1);
            let q = d.input_quant(1);
            Ok(scalars
                .with("coord_dim", coord_dim)
                .with("update_width", as_i32("update_width", update_width)?)
                .with("output_width", as_i32("output_width", output_width)?)
                .with("update_scale", q.scale())
                .with("update_tail", q.tail()))
        };

        let view = geo.view();
        Ok(PipelineTemplate::new("scatter_nd_update_pipeline")
            .transient(TransientSpec::like("accumulator", Binding::OutputView(0, view.clone())).dtype(DType::F32))
            .transient(TransientSpec::like("contributions", Binding::OutputView(0, view.clone())).dtype(DType::F32))
            .transient(TransientSpec::like("merged", Binding::OutputView(0, view.clone())))
            .stage(
                StageSpec::new("reset", RESET_FAMILY)
                    .input(Binding::InputView(0, view.clone()))
                    .output(Binding::Transient(0))
                    .output(Binding::Transient(1))
                    .key([Binding::Input(0)])
                    .scalars(reset_scalars),
            )
            .stage(
                StageSpec::new("update", UPDATE_FAMILY)
                    .input(Binding::InputView(1, geo.indices_view()))
                    .input(Binding::InputView(2, geo.updates_view()))
                    .output(Binding::Transient(1))
                    .key([Binding::Input(2)])
                    .flags([reduction.flag()])
                    .scalars(update_scalars),
            )
            .stage(
                StageSpec::new("merge", MERGE_FAMILY)
                    .input(Binding::Transient(0))
                    .input(Binding::Transient(1))
                    .output(Binding::Transient(2))
                    .key([Binding::Transient(2)])
                    .flags([reduction.flag()])
                    .scalars(merge_scalars),
            )
            .stage(
                StageSpec::new("copy", COPY_FAMILY)
                    .input(Binding::Transient(2))
                    .output(Binding::OutputView(0, view))
                    .key([Binding::Transient(2), Binding::Output(0)])
                    .scalars(copy_scalars),
            ))
    }
}

impl Operator for ScatterNdUpdate {
    fn tag(&self) -> &'static str {
        "scatter_nd_update"
    }

    fn strategies(&self, inv: &Invocation<'_>) -> Result<Vec<PipelineTemplate>> {
        let reference = inv.input(0)?;
        let indices = inv.input(1)?;
        let updates = inv.input(2)?;
        let output = inv.output(0)?;
        if indices.dtype != DType::I32 {
            return Err(inv.unsupported(format!("indices must be i32, got {}", indices.dtype)));
        }
        if output.numel() != reference.numel() {
            return Err(Error::ShapeConstraint(format!(
                "output {:?} does not match reference {:?}",
                output.shape, reference.shape
            )));
        }
        let reduction = if inv.attrs.contains("reduction") {
            inv.attrs.str("reduction")?.parse()?
        } else {
            Reduction::None
        };
        let repeated = inv.attrs.bool_or("repeated_indices", false)?;
        let geo = ScatterGeometry::new(reference, indices, updates)?;

        let mut strategies = Vec::with_capacity(2);
        let fast_ok = !repeated
            && reduction == Reduction::None
            && geo.coord_dim <= MAX_FAST_COORD_DIM
            && geo.rows < inv.config.max_image_width
            && geo.index_num < inv.config.max_image_width;
        if fast_ok {
            strategies.push(Self::fast_path(&geo, inv.config.capability.flag())?);
        }
        strategies.push(Self::pipeline(&geo, reduction)?);
        Ok(strategies)
    }
}

inventory::submit! { OperatorRegistration::new(&ScatterNdUpdate) }
