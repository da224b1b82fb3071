//! Registry-wide properties of the linked operator families.

mod test_helpers;

use std::collections::HashSet;
use std::sync::Arc;

use test_helpers::{init_logging, meta};
use vxplan::registry::DEFAULT_HASHED_LOOKUP_THRESHOLD;
use vxplan::{
    shared_registry, AttributeBag, DType, DispatchPlanner, Geometry, PlanInput, VariantRegistry,
};

#[test]
fn test_every_family_is_registered() {
    init_logging();
    let registry = shared_registry().unwrap();
    let names: Vec<_> = registry.families().iter().map(|f| f.name()).collect();
    assert_eq!(
        names,
        vec![
            "bucketize",
            "clip",
            "cumsum",
            "scatter_nd_update",
            "scatter_nd_update_copy",
            "scatter_nd_update_merge",
            "scatter_nd_update_reset",
            "scatter_nd_update_update",
        ]
    );
    assert_eq!(registry.variant_count(), 10 + 16 + 15 + 18 + 5 + 25 + 25 + 5);
}

#[test]
fn test_shared_registry_passes_self_check() {
    init_logging();
    shared_registry().unwrap().self_check().unwrap();
}

#[test]
fn test_keys_and_kernel_names_are_unique() {
    let registry = shared_registry().unwrap();
    let mut kernel_names = HashSet::new();
    for family in registry.families() {
        let mut keys = HashSet::new();
        for v in family.variants() {
            assert!(keys.insert(v.key), "{}: duplicate key {}", family.name(), v.key);
            assert!(kernel_names.insert(v.kernel_name.clone()), "duplicate kernel {}", v.kernel_name);
        }
    }
}

#[test]
fn test_every_variant_is_reachable_from_its_signature() {
    let registry = shared_registry().unwrap();
    for family in registry.families() {
        for v in family.variants() {
            let dtypes: Vec<DType> = v
                .signature
                .classes
                .iter()
                .map(|&c| family.folding().representative(c).unwrap())
                .collect();
            let found = family.select(&dtypes, &v.signature.flags).unwrap().unwrap();
            assert!(Arc::ptr_eq(&found, v), "{} resolved to {}", v.kernel_name, found.kernel_name);
            let via_registry = registry.lookup(family.name(), v.key).unwrap();
            assert!(Arc::ptr_eq(&via_registry, v));
        }
    }
}

#[test]
fn test_hashed_lookup_matches_linear_scan() {
    init_logging();
    let linear = shared_registry().unwrap();
    assert!(linear.families().iter().all(|f| f.variants().len() <= DEFAULT_HASHED_LOOKUP_THRESHOLD));
    assert!(linear.families().iter().all(|f| !f.is_hashed()));

    let hashed = VariantRegistry::from_inventory(4).unwrap();
    hashed.self_check().unwrap();
    assert!(hashed.families().iter().all(|f| f.is_hashed()));

    for family in linear.families() {
        for v in family.variants() {
            let other = hashed.lookup(family.name(), v.key).unwrap();
            assert_eq!(other.kernel_name, v.kernel_name);
        }
    }
}

#[test]
fn test_unknown_family_is_empty() {
    let registry = shared_registry().unwrap();
    assert!(registry.family("softmax").is_none());
    let key = registry.families()[0].variants()[0].key;
    assert!(registry.lookup("softmax", key).is_none());
}

#[test]
fn test_derived_grids_cover_their_extents() {
    let registry = shared_registry().unwrap();
    let attrs = AttributeBag::new()
        .with("min_value", -1.0)
        .with("max_value", 1.0)
        .with("axis", 0i64);
    let shapes: [&[usize]; 7] = [
        &[1],
        &[7],
        &[33, 5],
        &[4, 4, 4],
        &[3, 17, 9, 2],
        &[65535, 2],
        &[2, 3, 5, 7, 11],
    ];
    for family in registry.families() {
        for v in family.variants() {
            // initializer geometries read stage-specific inputs
            if matches!(v.geometry, Geometry::Custom(_)) {
                continue;
            }
            for shape in shapes {
                let outputs = [meta(shape, DType::F32)];
                let input = PlanInput {
                    inputs: &outputs,
                    outputs: &outputs,
                    attrs: &attrs,
                };
                let plan = DispatchPlanner.plan(v, &input).unwrap();
                plan.validate().unwrap();
                let elements: usize = shape.iter().product();
                if let Geometry::Linear { lanes } = v.geometry {
                    assert_eq!(plan.global_size[0], elements.div_ceil(lanes), "{}", v.kernel_name);
                } else {
                    assert!(plan.work_items() >= 1);
                    assert_eq!(plan.global_size[0] % plan.alignment[0], 0);
                }
            }
        }
    }
}
