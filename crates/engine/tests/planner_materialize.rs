//! End-to-end materialization behavior through the planner.

use std::sync::{Arc, Mutex};

use sfq_common::{Cell, CellType, EngineConfig, QueryRuntime, SfqError};
use sfq_engine::{
    infer_length, make_logical_filter_node, make_project_node, make_reduce_node,
    make_sarray_source_node, make_sframe_source_node, make_transform_node, make_union_node,
    make_append_node, read_node, MaterializeOptions, NodeRef, Planner, PlannerNodeType,
    SumReducer,
};
use sfq_storage::{SArray, SFrame};

fn planner() -> Planner {
    planner_with_batch(4)
}

fn planner_with_batch(batch_size_rows: usize) -> Planner {
    let config = EngineConfig {
        batch_size_rows,
        ..EngineConfig::default()
    };
    Planner::new(QueryRuntime::new(), config)
}

fn int_column(values: impl IntoIterator<Item = i64>) -> SArray {
    SArray::from_cells(
        values.into_iter().map(Cell::Integer),
        CellType::Integer,
        3,
    )
    .unwrap()
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Cell> {
    values.into_iter().map(Cell::Integer).collect()
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
fn integer_sum_reduce() {
    let p = planner();
    let tip = make_reduce_node(
        make_sarray_source_node(int_column(1..=5)),
        Arc::new(SumReducer),
    )
    .unwrap();
    let opts = MaterializeOptions {
        num_segments: 4,
        ..MaterializeOptions::default()
    };
    let frame = p.materialize(&tip, opts).unwrap();
    assert_eq!(frame.num_rows(), 1);
    assert_eq!(frame.column(0).dtype(), CellType::Integer);
    assert_eq!(frame.column(0).to_vec().unwrap(), vec![Cell::Integer(15)]);
    // the tip was rewritten in place to a source over the result
    assert_eq!(read_node(&tip).kind, PlannerNodeType::SFrameSource);
}

#[test]
fn filter_then_transform() {
    let p = planner();
    let data = make_sarray_source_node(int_column([10, 20, 30, 40]));
    let mask = make_sarray_source_node(int_column([1, 0, 1, 1]));
    let tip = times_two(make_logical_filter_node(data, mask).unwrap());
    let opts = MaterializeOptions {
        num_segments: 3,
        ..MaterializeOptions::default()
    };
    let frame = p.materialize(&tip, opts).unwrap();
    assert_eq!(frame.column(0).to_vec().unwrap(), ints([20, 60, 80]));
}

#[test]
fn full_range_frame_source_fast_path_shares_columns() {
    let p = planner();
    let frame = SFrame::from_columns(
        vec![int_column(0..3), int_column(10..13), int_column(20..23)],
        vec!["a".into(), "b".into(), "c".into()],
    )
    .unwrap();
    let a = frame.column(0).clone();
    let c = frame.column(2).clone();

    let tip = make_project_node(make_sframe_source_node(frame), vec![0, 2]).unwrap();
    let opts = MaterializeOptions {
        output_column_names: vec!["a".into(), "c".into()],
        ..MaterializeOptions::default()
    };
    let result = p.materialize(&tip, opts).unwrap();

    // pass-through: the projected columns are the original handles
    assert!(result.column(0).ptr_eq(&a));
    assert!(result.column(1).ptr_eq(&c));
    assert_eq!(result.column_names(), &["a", "c"]);
    assert_eq!(read_node(&tip).kind, PlannerNodeType::SFrameSource);
}

#[test]
fn full_range_array_source_fast_path() {
    let p = planner();
    let column = int_column(5..9);
    let tip = make_sarray_source_node(column.clone());
    let frame = p.materialize(&tip, MaterializeOptions::default()).unwrap();
    assert_eq!(frame.column_names(), &["X1"]);
    assert!(frame.column(0).ptr_eq(&column));
}

#[test]
fn union_project_stitches_passthrough_and_computed_columns() {
    let p = planner();
    let frame = SFrame::from_columns(
        vec![int_column(0..4), int_column(10..14)],
        vec!["a".into(), "b".into()],
    )
    .unwrap();
    let b = frame.column(1).clone();
    let computed = add_one(make_sarray_source_node(int_column(100..104)));
    let union = make_union_node(vec![make_sframe_source_node(frame), computed]).unwrap();
    let tip = make_project_node(union, vec![1, 2]).unwrap();

    let result = p.materialize(&tip, MaterializeOptions::default()).unwrap();
    assert_eq!(result.num_columns(), 2);
    // "b" was forwarded, not re-read
    assert!(result.column(0).ptr_eq(&b));
    assert_eq!(result.column(1).to_vec().unwrap(), ints(101..105));
}

#[test]
fn append_of_two_sources() {
    let p = planner();
    let a = make_sarray_source_node(int_column([1, 2]));
    let b = make_sarray_source_node(int_column([3, 4, 5]));
    let tip = make_append_node(a, b).unwrap();
    assert_eq!(infer_length(&tip).unwrap(), Some(5));
    let frame = p.materialize(&tip, MaterializeOptions::default()).unwrap();
    assert_eq!(frame.column(0).to_vec().unwrap(), ints(1..=5));
}

#[test]
fn segment_count_does_not_change_the_answer() {
    let data: Vec<i64> = (0..103).collect();
    let mask: Vec<i64> = data.iter().map(|v| i64::from(v % 3 != 0)).collect();
    let expected: Vec<Cell> = data
        .iter()
        .filter(|v| *v % 3 != 0)
        .map(|v| Cell::Integer(v * 2))
        .collect();

    for segments in [1usize, 2, 4, 8] {
        let p = planner();
        let d = make_sarray_source_node(int_column(data.clone()));
        let m = make_sarray_source_node(int_column(mask.clone()));
        let tip = times_two(make_logical_filter_node(d, m).unwrap());
        let opts = MaterializeOptions {
            num_segments: segments,
            ..MaterializeOptions::default()
        };
        let frame = p.materialize(&tip, opts).unwrap();
        assert_eq!(
            frame.column(0).to_vec().unwrap(),
            expected,
            "segments = {segments}"
        );
    }
}

#[test]
fn conflicting_slicing_codes_materialize_one_input_in_place() {
    let p = planner();
    let f1 = make_logical_filter_node(
        make_sarray_source_node(int_column(0..8)),
        make_sarray_source_node(int_column([1, 0, 1, 0, 1, 0, 1, 0])),
    )
    .unwrap();
    let f2 = make_logical_filter_node(
        make_sarray_source_node(int_column(10..18)),
        make_sarray_source_node(int_column([0, 1, 0, 1, 0, 1, 0, 1])),
    )
    .unwrap();
    let tip = make_union_node(vec![f1.clone(), f2.clone()]).unwrap();

    // optimization off so the original handles are the executed graph and
    // the in-place rewrite is observable
    let opts = MaterializeOptions {
        disable_optimization: true,
        ..MaterializeOptions::default()
    };
    let frame = p.materialize(&tip, opts).unwrap();
    assert_eq!(frame.column(0).to_vec().unwrap(), ints([0, 2, 4, 6]));
    assert_eq!(frame.column(1).to_vec().unwrap(), ints([11, 13, 15, 17]));

    // the planner had to spill exactly the second filter to storage
    assert_eq!(read_node(&f1).kind, PlannerNodeType::LogicalFilter);
    assert_eq!(read_node(&f2).kind, PlannerNodeType::SFrameSource);
}

#[test]
fn naive_mode_matches_the_analyzed_plan() {
    let build = || {
        let f1 = make_logical_filter_node(
            make_sarray_source_node(int_column(0..9)),
            make_sarray_source_node(int_column([1, 1, 0, 1, 0, 0, 1, 1, 0])),
        )
        .unwrap();
        times_two(f1)
    };
    let p = planner();
    let normal = p
        .materialize(&build(), MaterializeOptions::default())
        .unwrap();
    let naive = p
        .materialize(
            &build(),
            MaterializeOptions {
                naive_mode: true,
                ..MaterializeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(
        normal.column(0).to_vec().unwrap(),
        naive.column(0).to_vec().unwrap()
    );
}

#[test]
fn optimized_and_unoptimized_plans_agree() {
    let build = || {
        let frame = SFrame::from_columns(
            vec![int_column(0..20), int_column(100..120)],
            vec!["x".into(), "y".into()],
        )
        .unwrap();
        let src = make_sframe_source_node(frame);
        let projected = make_project_node(src, vec![1]).unwrap();
        times_two(add_one(projected))
    };
    let p = planner();
    let opt = p.materialize(&build(), MaterializeOptions::default()).unwrap();
    let plain = p
        .materialize(
            &build(),
            MaterializeOptions {
                disable_optimization: true,
                ..MaterializeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(
        opt.column(0).to_vec().unwrap(),
        plain.column(0).to_vec().unwrap()
    );
}

#[test]
fn callback_sink_streams_segment_ordered_blocks() {
    let p = planner();
    let tip = add_one(make_sarray_source_node(int_column(0..50)));
    let per_segment: Arc<Mutex<Vec<Vec<Cell>>>> =
        Arc::new(Mutex::new(vec![Vec::new(); 4]));
    let sink = per_segment.clone();
    let opts = MaterializeOptions {
        num_segments: 4,
        write_callback: Some(Arc::new(move |segment, block: &sfq_engine::RowBatch| {
            sink.lock().unwrap()[segment].extend_from_slice(block.column(0));
            Ok(false)
        })),
        ..MaterializeOptions::default()
    };
    p.materialize(&tip, opts).unwrap();
    let collected: Vec<Cell> = per_segment
        .lock()
        .unwrap()
        .iter()
        .flat_map(|v| v.iter().cloned())
        .collect();
    assert_eq!(collected, ints(1..51));
}

#[test]
fn callback_stop_ends_the_query_early() {
    let p = planner();
    let tip = add_one(make_sarray_source_node(int_column(0..1000)));
    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    let opts = MaterializeOptions {
        num_segments: 1,
        write_callback: Some(Arc::new(move |_segment, block: &sfq_engine::RowBatch| {
            *sink.lock().unwrap() += block.num_rows();
            Ok(true)
        })),
        ..MaterializeOptions::default()
    };
    p.materialize(&tip, opts).unwrap();
    let seen = *seen.lock().unwrap();
    assert!(seen > 0 && seen < 1000, "saw {seen} rows");
}

#[test]
fn cancellation_surfaces_as_cancelled() {
    let runtime = QueryRuntime::new();
    let p = Planner::new(runtime.clone(), EngineConfig::default());
    runtime.cancel_flag().cancel();
    let tip = add_one(make_sarray_source_node(int_column(0..10)));
    assert!(matches!(
        p.materialize(&tip, MaterializeOptions::default()),
        Err(SfqError::Cancelled)
    ));
}

#[test]
fn operator_failures_reach_the_driver() {
    let p = planner();
    let tip = make_transform_node(
        make_sarray_source_node(int_column(0..10)),
        Arc::new(|row: &[Cell]| match row[0].as_integer() {
            Some(v) if v != 7 => Ok(Cell::Integer(v)),
            _ => Err(SfqError::TypeMismatch("poison row".into())),
        }),
        CellType::Integer,
    )
    .unwrap();
    assert!(matches!(
        p.materialize(&tip, MaterializeOptions::default()),
        Err(SfqError::TypeMismatch(_))
    ));
}

#[test]
fn reduce_below_a_transform_runs_in_the_pipeline() {
    let p = planner();
    let reduce = make_reduce_node(
        make_sarray_source_node(int_column(1..=4)),
        Arc::new(SumReducer),
    )
    .unwrap();
    let tip = times_two(reduce);
    let frame = p.materialize(&tip, MaterializeOptions::default()).unwrap();
    assert_eq!(frame.column(0).to_vec().unwrap(), vec![Cell::Integer(20)]);
}

#[test]
fn deep_lazy_plans_trigger_the_materialization_advisory() {
    let config = EngineConfig {
        max_lazy_node_size: 5,
        ..EngineConfig::default()
    };
    let p = Planner::new(QueryRuntime::new(), config);
    let mut node = make_sarray_source_node(int_column(0..4));
    assert!(!p.online_materialization_recommended(&node));
    for _ in 0..6 {
        node = add_one(node);
    }
    assert!(p.online_materialization_recommended(&node));
}

#[test]
fn materialize_as_planner_node_wraps_the_result() {
    let p = planner();
    let tip = add_one(make_sarray_source_node(int_column(0..5)));
    let node = p
        .materialize_as_planner_node(&tip, MaterializeOptions::default())
        .unwrap();
    assert_eq!(read_node(&node).kind, PlannerNodeType::SFrameSource);
    assert_eq!(infer_length(&node).unwrap(), Some(5));
}

#[test]
fn saved_output_round_trips_through_the_archive() {
    let p = planner_with_batch(8);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("result");
    let tip = add_one(make_sarray_source_node(int_column(0..12)));
    let opts = MaterializeOptions {
        output_path: Some(out.clone()),
        output_column_names: vec!["bumped".into()],
        ..MaterializeOptions::default()
    };
    p.materialize(&tip, opts).unwrap();

    assert!(sfq_storage::is_directory_archive(&out));
    assert_eq!(
        sfq_storage::archive_kind(&out).unwrap(),
        sfq_storage::ArchiveKind::SFrame
    );
    let reopened = SFrame::open(&out).unwrap();
    assert_eq!(reopened.column_names(), &["bumped"]);
    assert_eq!(reopened.column(0).to_vec().unwrap(), ints(1..13));
}
