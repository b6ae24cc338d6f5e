//! Execution-node and operator behavior, driven directly through
//! `build_execution_graph` without the planner.

use std::sync::Arc;

use sfq_common::{CancelFlag, Cell, CellType, SfqError};
use sfq_engine::{
    build_execution_graph, make_append_node, make_logical_filter_node, make_range_node,
    make_sarray_source_node, make_transform_node, make_union_node, NodeRef,
};
use sfq_storage::SArray;

fn int_column(values: impl IntoIterator<Item = i64>, segments: usize) -> SArray {
    SArray::from_cells(
        values.into_iter().map(Cell::Integer),
        CellType::Integer,
        segments,
    )
    .unwrap()
}

fn drain(tip: &NodeRef, batch_size: usize) -> Vec<Vec<Cell>> {
    let (root, cid) = build_execution_graph(tip, CancelFlag::new(), batch_size).unwrap();
    let mut blocks = Vec::new();
    while let Some(block) = root.get_next(cid, false).unwrap() {
        blocks.push(block.columns().to_vec());
    }
    blocks.into_iter().map(|cols| cols[0].clone()).collect()
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Cell> {
    values.into_iter().map(Cell::Integer).collect()
}

#[test]
fn source_emits_fixed_size_blocks_with_short_tail() {
    let tip = make_sarray_source_node(int_column(0..10, 3));
    let blocks = drain(&tip, 4);
    assert_eq!(
        blocks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![4, 4, 2]
    );
    assert_eq!(blocks.concat(), ints(0..10));
}

#[test]
fn transform_is_length_preserving_and_positional() {
    let src = make_sarray_source_node(int_column(0..7, 2));
    let tip = make_transform_node(
        src,
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 10))),
        CellType::Integer,
    )
    .unwrap();
    let blocks = drain(&tip, 3);
    assert_eq!(
        blocks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![3, 3, 1]
    );
    assert_eq!(blocks.concat(), ints((0..7).map(|v| v * 10)));
}

#[test]
fn filter_selects_exactly_the_truthy_rows() {
    let data = make_sarray_source_node(int_column(10..22, 2));
    let mask = make_sarray_source_node(int_column(
        [1, 0, 1, 1, 0, 0, 1, 0, 1, 1, 1, 0],
        2,
    ));
    let tip = make_logical_filter_node(data, mask).unwrap();
    let blocks = drain(&tip, 4);
    // re-buffered: all full blocks except the tail
    assert_eq!(
        blocks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![4, 3]
    );
    assert_eq!(blocks.concat(), ints([10, 12, 13, 16, 18, 19, 20]));
}

#[test]
fn filter_with_empty_selection_emits_nothing() {
    let data = make_sarray_source_node(int_column(0..5, 1));
    let mask = make_sarray_source_node(int_column([0, 0, 0, 0, 0], 1));
    let tip = make_logical_filter_node(data, mask).unwrap();
    assert!(drain(&tip, 4).is_empty());
}

#[test]
fn append_rebatches_across_the_input_seam() {
    let a = make_sarray_source_node(int_column(0..5, 2));
    let b = make_sarray_source_node(int_column(5..12, 3));
    let tip = make_append_node(a, b).unwrap();
    let blocks = drain(&tip, 4);
    assert_eq!(
        blocks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![4, 4, 4]
    );
    assert_eq!(blocks.concat(), ints(0..12));
}

#[test]
fn union_pairs_rows_of_shared_and_distinct_sources() {
    let src = make_range_node(0, 9).unwrap();
    let doubled = make_transform_node(
        src.clone(),
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 2))),
        CellType::Integer,
    )
    .unwrap();
    // the union consumes the range twice: once raw, once transformed;
    // both consumers advance the shared node in lock step
    let tip = make_union_node(vec![src, doubled]).unwrap();
    let (root, cid) = build_execution_graph(&tip, CancelFlag::new(), 4).unwrap();
    let mut raw = Vec::new();
    let mut twice = Vec::new();
    while let Some(block) = root.get_next(cid, false).unwrap() {
        assert_eq!(block.num_columns(), 2);
        raw.extend_from_slice(block.column(0));
        twice.extend_from_slice(block.column(1));
    }
    assert_eq!(raw, ints(0..9));
    assert_eq!(twice, ints((0..9).map(|v| v * 2)));
}

#[test]
fn lagging_consumer_beyond_one_block_is_an_invariant_violation() {
    let tip = make_sarray_source_node(int_column(0..10, 1));
    let (root, c0) = build_execution_graph(&tip, CancelFlag::new(), 2).unwrap();
    let _c1 = root.register_consumer();

    // consumer 0 may run one block ahead of the idle consumer 1
    assert!(root.get_next(c0, false).unwrap().is_some());
    assert!(root.get_next(c0, false).unwrap().is_some());
    // two ahead trips the rate-coupling latch
    let err = root.get_next(c0, false).unwrap_err();
    assert!(matches!(err, SfqError::Internal(_)));
    assert!(root.exception().is_some());
}

#[test]
fn lockstep_consumers_share_blocks_without_recomputation() {
    let tip = make_sarray_source_node(int_column(0..8, 1));
    let (root, c0) = build_execution_graph(&tip, CancelFlag::new(), 3).unwrap();
    let c1 = root.register_consumer();
    let mut a = Vec::new();
    let mut b = Vec::new();
    loop {
        let x = root.get_next(c0, false).unwrap();
        let y = root.get_next(c1, false).unwrap();
        match (x, y) {
            (Some(x), Some(y)) => {
                // same physical block served to both
                assert!(std::rc::Rc::ptr_eq(&x, &y));
                a.extend_from_slice(x.column(0));
                b.extend_from_slice(y.column(0));
            }
            (None, None) => break,
            _ => panic!("consumers ended at different positions"),
        }
    }
    assert_eq!(a, ints(0..8));
    assert_eq!(b, ints(0..8));
}

#[test]
fn skipped_blocks_carry_shape_but_not_payload() {
    let tip = make_sarray_source_node(int_column(0..10, 2));
    let (root, cid) = build_execution_graph(&tip, CancelFlag::new(), 4).unwrap();

    let skipped = root.get_next(cid, true).unwrap().unwrap();
    assert_eq!(skipped.num_rows(), 4);
    assert!(skipped.column(0).iter().all(Cell::is_undefined));

    // the cursor advanced past the skipped block; real reads resume after it
    let real = root.get_next(cid, false).unwrap().unwrap();
    assert_eq!(real.column(0), &ints(4..8)[..]);
}

#[test]
fn operator_failure_latches_on_the_node() {
    let src = make_sarray_source_node(int_column(0..10, 1));
    let tip = make_transform_node(
        src,
        Arc::new(|row: &[Cell]| match row[0].as_integer() {
            Some(v) if v < 3 => Ok(Cell::Integer(v)),
            _ => Err(SfqError::TypeMismatch("boom".into())),
        }),
        CellType::Integer,
    )
    .unwrap();
    let (root, cid) = build_execution_graph(&tip, CancelFlag::new(), 2).unwrap();
    assert!(root.get_next(cid, false).unwrap().is_some());
    let err = root.get_next(cid, false).unwrap_err();
    assert!(matches!(err, SfqError::TypeMismatch(_)));
    // latched: every later pull re-reports the same failure
    assert!(root.get_next(cid, false).is_err());
    assert!(matches!(root.exception(), Some(SfqError::TypeMismatch(_))));
}

#[test]
fn cancellation_unwinds_at_a_block_boundary() {
    let cancel = CancelFlag::new();
    let tip = make_sarray_source_node(int_column(0..100, 1));
    let (root, cid) = build_execution_graph(&tip, cancel.clone(), 4).unwrap();
    assert!(root.get_next(cid, false).unwrap().is_some());
    cancel.cancel();
    assert!(matches!(
        root.get_next(cid, false).unwrap_err(),
        SfqError::Cancelled
    ));
}

#[test]
fn reset_rewinds_a_node_graph() {
    let tip = make_range_node(0, 6).unwrap();
    let (root, cid) = build_execution_graph(&tip, CancelFlag::new(), 4).unwrap();
    let first: Vec<Cell> = {
        let mut v = Vec::new();
        while let Some(b) = root.get_next(cid, false).unwrap() {
            v.extend_from_slice(b.column(0));
        }
        v
    };
    root.reset();
    let second: Vec<Cell> = {
        let mut v = Vec::new();
        while let Some(b) = root.get_next(cid, false).unwrap() {
            v.extend_from_slice(b.column(0));
        }
        v
    };
    assert_eq!(first, second);
}
