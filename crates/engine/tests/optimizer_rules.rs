//! Structural behavior of the plan rewriter.

use std::sync::Arc;

use sfq_common::{CancelFlag, Cell, CellType};
use sfq_engine::{
    build_execution_graph, infer_dtype, infer_num_columns, make_append_node, make_identity_node,
    make_logical_filter_node, make_project_node, make_sarray_source_node,
    make_sframe_source_node, make_sframe_source_range_node, make_transform_node,
    make_union_node, optimize_planner_graph, read_node, MaterializeOptions, NodeRef,
    OpaqueParam, PlannerNodeType,
};
use sfq_storage::{SArray, SFrame};

fn int_column(values: impl IntoIterator<Item = i64>) -> SArray {
    SArray::from_cells(
        values.into_iter().map(Cell::Integer),
        CellType::Integer,
        2,
    )
    .unwrap()
}

fn abc_frame() -> SFrame {
    SFrame::from_columns(
        vec![int_column(0..4), int_column(10..14), int_column(20..24)],
        vec!["a".into(), "b".into(), "c".into()],
    )
    .unwrap()
}

fn optimize(tip: &NodeRef) -> NodeRef {
    optimize_planner_graph(tip, &MaterializeOptions::default()).unwrap()
}

fn drain_column(tip: &NodeRef) -> Vec<Cell> {
    let (root, cid) = build_execution_graph(tip, CancelFlag::new(), 4).unwrap();
    let mut out = Vec::new();
    while let Some(b) = root.get_next(cid, false).unwrap() {
        out.extend_from_slice(b.column(0));
    }
    out
}

fn add_one(node: NodeRef) -> NodeRef {
    make_transform_node(
        node,
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() + 1))),
        CellType::Integer,
    )
    .unwrap()
}

fn times_two(node: NodeRef) -> NodeRef {
    make_transform_node(
        node,
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 2))),
        CellType::Integer,
    )
    .unwrap()
}

#[test]
fn identity_nodes_are_erased() {
    let src = make_sarray_source_node(int_column(0..3));
    let tip = add_one(make_identity_node(src));
    let opt = optimize(&tip);
    assert_eq!(read_node(&opt).kind, PlannerNodeType::Transform);
    assert_eq!(
        read_node(&read_node(&opt).inputs[0]).kind,
        PlannerNodeType::SArraySource
    );
}

#[test]
fn adjacent_transforms_fuse_into_a_composed_function() {
    let src = make_sarray_source_node(int_column(0..3));
    let tip = times_two(add_one(src));
    let opt = optimize(&tip);

    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::Transform);
    assert_eq!(
        read_node(&n.inputs[0]).kind,
        PlannerNodeType::SArraySource
    );
    drop(n);
    // (x + 1) * 2
    assert_eq!(
        drain_column(&opt),
        vec![Cell::Integer(2), Cell::Integer(4), Cell::Integer(6)]
    );
}

#[test]
fn a_shared_inner_transform_does_not_fuse() {
    let src = make_sarray_source_node(int_column(0..3));
    let mid = add_one(src);
    let tip = make_union_node(vec![times_two(mid.clone()), add_one(mid)]).unwrap();
    let opt = optimize(&tip);

    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::Union);
    let left = read_node(&n.inputs[0]);
    let right = read_node(&n.inputs[1]);
    assert_eq!(left.kind, PlannerNodeType::Transform);
    assert_eq!(right.kind, PlannerNodeType::Transform);
    // both legs still hang off one shared inner transform
    assert!(Arc::ptr_eq(&left.inputs[0], &right.inputs[0]));
    assert_eq!(
        read_node(&left.inputs[0]).kind,
        PlannerNodeType::Transform
    );
}

#[test]
fn projections_compose() {
    let frame = abc_frame();
    let src = make_sframe_source_node(frame);
    // wrap the source in a transform-proof shell so the source rule stays out
    let filter_mask = make_sarray_source_node(int_column([1, 1, 0, 1]));
    let filtered = make_logical_filter_node(src, filter_mask).unwrap();
    let tip =
        make_project_node(make_project_node(filtered, vec![2, 0, 1]).unwrap(), vec![2, 0])
            .unwrap();
    let opt = optimize(&tip);
    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::Project);
    assert_eq!(n.scalar_index_list("indices").unwrap(), vec![1, 2]);
    assert_eq!(
        read_node(&n.inputs[0]).kind,
        PlannerNodeType::LogicalFilter
    );
}

#[test]
fn projection_narrows_a_frame_source_to_shared_column_handles() {
    let frame = abc_frame();
    let a = frame.column(0).clone();
    let c = frame.column(2).clone();
    let tip = make_project_node(make_sframe_source_node(frame), vec![0, 2]).unwrap();
    let opt = optimize(&tip);
    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::SFrameSource);
    let selected = n.frame("frame").unwrap();
    assert_eq!(selected.num_columns(), 2);
    assert!(selected.column(0).ptr_eq(&a));
    assert!(selected.column(1).ptr_eq(&c));
}

#[test]
fn project_over_union_collapses_with_a_passthrough_table() {
    let frame = abc_frame();
    let b = frame.column(1).clone();
    let src = make_sframe_source_node(frame);
    let computed = add_one(make_sarray_source_node(int_column(0..4)));
    let union = make_union_node(vec![src, computed]).unwrap();
    // keep the stored "b" column and the computed column
    let tip = make_project_node(union, vec![1, 3]).unwrap();
    let opt = optimize(&tip);

    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::GeneralizedUnionProject);
    assert_eq!(n.scalar_index_list("indices").unwrap(), vec![1, 3]);
    match n.opaque("direct_source_mapping").unwrap() {
        OpaqueParam::SourceMapping(m) => {
            assert_eq!(m.len(), 1);
            assert!(m.get(&0).unwrap().ptr_eq(&b));
        }
        other => panic!("expected source mapping, got {other:?}"),
    }
}

#[test]
fn filter_lifts_below_a_private_transform() {
    let src = make_sarray_source_node(int_column(0..6));
    let mask = make_sarray_source_node(int_column([1, 0, 1, 0, 1, 0]));
    let tip = make_logical_filter_node(add_one(src.clone()), mask).unwrap();
    let opt = optimize(&tip);

    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::Transform);
    let inner = read_node(&n.inputs[0]);
    assert_eq!(inner.kind, PlannerNodeType::LogicalFilter);
    assert_eq!(
        read_node(&inner.inputs[0]).kind,
        PlannerNodeType::SArraySource
    );
    drop(inner);
    drop(n);
    // filtered first, transformed after: (0, 2, 4) + 1
    assert_eq!(
        drain_column(&opt),
        vec![Cell::Integer(1), Cell::Integer(3), Cell::Integer(5)]
    );
}

#[test]
fn union_of_full_range_sources_merges_into_one_frame_source() {
    let left = abc_frame();
    let right = int_column(30..34);
    let tip = make_union_node(vec![
        make_sframe_source_node(left.clone()),
        make_sarray_source_node(right.clone()),
    ])
    .unwrap();
    let opt = optimize(&tip);
    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::SFrameSource);
    let merged = n.frame("frame").unwrap();
    assert_eq!(merged.num_columns(), 4);
    assert!(merged.column(0).ptr_eq(left.column(0)));
    assert!(merged.column(3).ptr_eq(&right));
}

#[test]
fn contiguous_append_ranges_merge_only_in_the_full_pass() {
    let frame = abc_frame();
    let top = make_sframe_source_range_node(frame.clone(), 0, 2).unwrap();
    let bottom = make_sframe_source_range_node(frame, 2, 4).unwrap();
    let tip = make_append_node(top, bottom).unwrap();

    let full = optimize(&tip);
    let n = read_node(&full);
    assert_eq!(n.kind, PlannerNodeType::SFrameSource);
    assert_eq!(n.scalar_u64("begin_index").unwrap(), 0);
    assert_eq!(n.scalar_u64("end_index").unwrap(), 4);
    drop(n);

    let first_pass = optimize_planner_graph(
        &tip,
        &MaterializeOptions {
            first_pass_only: true,
            ..MaterializeOptions::default()
        },
    )
    .unwrap();
    assert_eq!(read_node(&first_pass).kind, PlannerNodeType::Append);
}

#[test]
fn inference_is_pure_across_structurally_equal_plans() {
    let build = || {
        let src = make_sarray_source_node(int_column(0..5));
        add_one(src)
    };
    let (a, b) = (build(), build());
    assert_eq!(infer_dtype(&a).unwrap(), infer_dtype(&b).unwrap());
    assert_eq!(
        infer_num_columns(&a).unwrap(),
        infer_num_columns(&b).unwrap()
    );
}

#[test]
fn optimizer_terminates_on_deep_shared_plans() {
    let src = make_sarray_source_node(int_column(0..4));
    let mut node = src;
    for _ in 0..40 {
        node = add_one(node);
    }
    let opt = optimize(&node);
    // the whole chain fuses down to a single transform over the source
    let n = read_node(&opt);
    assert_eq!(n.kind, PlannerNodeType::Transform);
    assert_eq!(
        read_node(&n.inputs[0]).kind,
        PlannerNodeType::SArraySource
    );
    drop(n);
    assert_eq!(
        drain_column(&opt),
        vec![
            Cell::Integer(40),
            Cell::Integer(41),
            Cell::Integer(42),
            Cell::Integer(43)
        ]
    );
}
