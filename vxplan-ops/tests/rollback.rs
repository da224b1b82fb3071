//! A failed resolution leaves the graph exactly as it found it.

mod test_helpers;

use rstest::rstest;
use test_helpers::{quantized, resolver, Invocation};
use vxplan::{AttributeBag, DType, DryRunGraph, Error, TensorMeta};

fn scatter_tensors(output: DType) -> (Vec<TensorMeta>, Vec<TensorMeta>) {
    let inputs = vec![
        quantized(&[4, 6], DType::U8, 0.5, 3),
        TensorMeta::new(vec![1, 3], DType::I32),
        quantized(&[4, 3], DType::U8, 0.5, 3),
    ];
    let outputs = vec![TensorMeta::new(vec![4, 6], output)];
    (inputs, outputs)
}

fn repeated() -> AttributeBag {
    AttributeBag::new().with("repeated_indices", true)
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(3)]
fn test_node_build_failure_rolls_back(#[case] at: usize) {
    let resolver = resolver();
    let (inputs, outputs) = scatter_tensors(DType::U8);
    let mut inv = Invocation::on(DryRunGraph::new().fail_node_build_at(at), inputs, outputs);

    let err = inv.resolve(&resolver, "scatter_nd_update", &repeated()).unwrap_err();
    assert!(matches!(err, Error::Graph(_)), "{err}");
    assert!(inv.graph.nodes().is_empty());
    inv.assert_no_leaks();
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
fn test_transient_failure_rolls_back(#[case] at: usize) {
    let resolver = resolver();
    let (inputs, outputs) = scatter_tensors(DType::U8);
    let mut inv = Invocation::on(DryRunGraph::new().fail_transient_at(at), inputs, outputs);

    let err = inv.resolve(&resolver, "scatter_nd_update", &repeated()).unwrap_err();
    assert!(matches!(err, Error::Graph(_)), "{err}");
    assert!(inv.graph.nodes().is_empty());
    assert_eq!(inv.graph.transients_created(), at);
    inv.assert_no_leaks();
}

#[test]
fn test_missing_merge_variant_rolls_back_built_stages() {
    let resolver = resolver();
    let (inputs, outputs) = scatter_tensors(DType::BF16);
    let mut inv = Invocation::new(inputs, outputs);

    let err = inv.resolve(&resolver, "scatter_nd_update", &repeated()).unwrap_err();
    assert!(err.is_not_supported(), "{err}");
    // reset and update were attached before merge failed to resolve
    assert_eq!(inv.graph.transients_created(), 2);
    assert!(inv.graph.nodes().is_empty());
    inv.assert_no_leaks();
}

#[test]
fn test_graph_is_reusable_after_rollback() {
    let resolver = resolver();
    let (inputs, outputs) = scatter_tensors(DType::U8);
    let mut inv = Invocation::on(DryRunGraph::new().fail_node_build_at(2), inputs, outputs);

    assert!(inv.resolve(&resolver, "scatter_nd_update", &repeated()).is_err());
    // the injected failure fired on the third build; later builds succeed
    let plan = inv.resolve(&resolver, "scatter_nd_update", &repeated()).unwrap();
    assert_eq!(plan.stages.len(), 4);
    assert_eq!(inv.graph.nodes().len(), 4);
    drop(plan);
    assert_eq!(inv.graph.live_scalars(), 0);
    assert_eq!(inv.graph.invalid_releases(), 0);
}
