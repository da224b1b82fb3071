//! Shape helpers shared by the planner and operator resolvers.
//!
//! Shapes are innermost first: `shape[0]` is the image width.

use crate::error::{Error, Result};

/// Round `value` up to a multiple of `align` (`align` of 0 or 1 is a no-op)
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Collapse a shape into three extents, merging every axis past the second
/// into the third. Rank 0 and 1 pad with ones.
#[must_use]
pub fn collapse_to_3d(shape: &[usize]) -> [usize; 3] {
    match shape {
        [] => [1, 1, 1],
        [w] => [*w, 1, 1],
        [w, h] => [*w, *h, 1],
        [w, h, rest @ ..] => [*w, *h, rest.iter().product()],
    }
}

/// Whether the shape can run on a 2D image path (collapsed depth is 1)
#[must_use]
pub fn is_image_2d(shape: &[usize]) -> bool {
    collapse_to_3d(shape)[2] == 1
}

/// The first `min(rank, 2)` extents must be nonzero and below `max_width`.
///
/// # Errors
/// Returns [`Error::ShapeConstraint`] naming the offending axis
pub fn check_image_shape(shape: &[usize], max_width: usize) -> Result<()> {
    for (axis, &extent) in shape.iter().take(2).enumerate() {
        if extent == 0 || extent >= max_width {
            return Err(Error::ShapeConstraint(format!(
                "extent {extent} on axis {axis} of {shape:?} is outside (0, {max_width})"
            )));
        }
    }
    Ok(())
}

/// Validate an axis attribute against a rank.
///
/// # Errors
/// Returns [`Error::ShapeConstraint`] when `axis` is outside `[0, rank)`
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    match usize::try_from(axis) {
        Ok(a) if a < rank => Ok(a),
        _ => Err(Error::ShapeConstraint(format!(
            "axis {axis} is outside [0, {rank})"
        ))),
    }
}

/// A shape reshaped around a reduction axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisShape {
    pub shape: Vec<usize>,
    pub axis: usize,
}

impl AxisShape {
    #[must_use]
    pub fn is_2d(&self) -> bool {
        self.shape.len() == 2
    }
}

/// Collapse `shape` into `[inner, axis_extent, outer]`, dropping unit
/// extents, so that the axis survives as a single dimension.
///
/// Inner or outer extents at or above `max_width` are split into two
/// factors, each below `max_width`.
///
/// # Errors
/// Returns [`Error::ShapeConstraint`] if the axis is out of range, the axis
/// extent itself is too wide, an extent has no usable factorization, or the
/// result needs more than three dimensions.
pub fn collapse_around_axis(shape: &[usize], axis: usize, max_width: usize) -> Result<AxisShape> {
    if axis >= shape.len() {
        return Err(Error::ShapeConstraint(format!(
            "axis {axis} is outside [0, {})",
            shape.len()
        )));
    }
    let extent = shape[axis];
    if extent >= max_width {
        return Err(Error::ShapeConstraint(format!(
            "axis extent {extent} exceeds maximum width {max_width}"
        )));
    }
    let inner: usize = shape[..axis].iter().product();
    let outer: usize = shape[axis + 1..].iter().product();

    let mut dims = Vec::with_capacity(5);
    push_split(&mut dims, inner, max_width)?;
    let new_axis = dims.len();
    dims.push(extent);
    push_split(&mut dims, outer, max_width)?;
    while dims.len() < 2 {
        dims.push(1);
    }
    if dims.len() > 3 {
        return Err(Error::ShapeConstraint(format!(
            "{shape:?} around axis {axis} needs {} dimensions",
            dims.len()
        )));
    }
    Ok(AxisShape {
        shape: dims,
        axis: new_axis,
    })
}

fn push_split(dims: &mut Vec<usize>, size: usize, max_width: usize) -> Result<()> {
    if size <= 1 {
        return Ok(());
    }
    if size < max_width {
        dims.push(size);
        return Ok(());
    }
    let [a, b] = split_extent(size, max_width).ok_or_else(|| {
        Error::ShapeConstraint(format!("extent {size} cannot be split below {max_width}"))
    })?;
    dims.push(a);
    dims.push(b);
    Ok(())
}

/// Largest divisor `d < max_width` of `size` whose cofactor is also below
/// `max_width`.
fn split_extent(size: usize, max_width: usize) -> Option<[usize; 2]> {
    let start = (max_width - 1).min(size);
    (2..=start)
        .rev()
        .find(|&d| size % d == 0 && size / d < max_width)
        .map(|d| [d, size / d])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 4, 0)]
    #[case(1, 4, 4)]
    #[case(4, 4, 4)]
    #[case(5, 4, 8)]
    #[case(7, 1, 7)]
    #[case(7, 0, 7)]
    fn test_align_up(#[case] value: usize, #[case] align: usize, #[case] expected: usize) {
        assert_eq!(align_up(value, align), expected);
    }

    #[rstest]
    #[case(&[], [1, 1, 1])]
    #[case(&[5], [5, 1, 1])]
    #[case(&[5, 3], [5, 3, 1])]
    #[case(&[5, 3, 1], [5, 3, 1])]
    #[case(&[5, 3, 2, 4], [5, 3, 8])]
    fn test_collapse_to_3d(#[case] shape: &[usize], #[case] expected: [usize; 3]) {
        assert_eq!(collapse_to_3d(shape), expected);
    }

    #[test]
    fn test_is_image_2d() {
        assert!(is_image_2d(&[16, 16]));
        assert!(is_image_2d(&[16, 16, 1, 1]));
        assert!(!is_image_2d(&[16, 16, 2]));
    }

    #[test]
    fn test_check_image_shape() {
        assert!(check_image_shape(&[100, 200, 70000], 65536).is_ok());
        assert!(check_image_shape(&[65536, 2], 65536).is_err());
        assert!(check_image_shape(&[4, 0], 65536).is_err());
    }

    #[rstest]
    #[case(0, 3, Some(0))]
    #[case(2, 3, Some(2))]
    #[case(3, 3, None)]
    #[case(-1, 3, None)]
    fn test_normalize_axis(#[case] axis: i64, #[case] rank: usize, #[case] expected: Option<usize>) {
        match expected {
            Some(a) => assert_eq!(normalize_axis(axis, rank).unwrap(), a),
            None => assert!(matches!(normalize_axis(axis, rank), Err(Error::ShapeConstraint(_)))),
        }
    }

    #[test]
    fn test_collapse_around_axis() {
        let s = collapse_around_axis(&[4, 5, 6, 7], 2, 65536).unwrap();
        assert_eq!(s, AxisShape { shape: vec![20, 6, 7], axis: 1 });

        let s = collapse_around_axis(&[1, 1, 6], 2, 65536).unwrap();
        assert_eq!(s, AxisShape { shape: vec![6, 1], axis: 0 });
        assert!(s.is_2d());

        let s = collapse_around_axis(&[8, 3], 0, 65536).unwrap();
        assert_eq!(s, AxisShape { shape: vec![8, 3], axis: 0 });
    }

    #[test]
    fn test_collapse_splits_wide_extents() {
        let s = collapse_around_axis(&[3, 100, 100], 0, 1000).unwrap();
        assert_eq!(s.axis, 0);
        assert_eq!(s.shape.len(), 3);
        assert_eq!(s.shape[1] * s.shape[2], 10_000);
        assert!(s.shape.iter().all(|&d| d < 1000));
    }

    #[test]
    fn test_collapse_rejects_unsplittable() {
        // Prime outer extent above the limit cannot be factored.
        assert!(collapse_around_axis(&[2, 1009], 0, 1000).is_err());
        assert!(collapse_around_axis(&[2000], 0, 1000).is_err());
        assert!(collapse_around_axis(&[2, 3], 2, 1000).is_err());
    }

    #[test]
    fn test_collapse_rejects_rank_above_three() {
        // Both sides need splitting: 2 + 1 + 2 dimensions.
        assert!(collapse_around_axis(&[10_000, 5, 10_000], 1, 1000).is_err());
    }
}
