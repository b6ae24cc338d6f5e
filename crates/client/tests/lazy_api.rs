//! End-to-end behavior of the lazy SArray/SFrame API.

use std::sync::Arc;

use sfq_client::{
    Cell, CellType, EngineConfig, InProcessLambdaChannel, SArray, SFrame, Session, SfqError,
    SumReducer,
};
use sfq_common::QueryRuntime;
use sfq_engine::{read_node, PlannerNodeType};

fn session() -> sfq_client::SharedSession {
    let config = EngineConfig {
        batch_size_rows: 8,
        ..EngineConfig::default()
    };
    Session::with_runtime(config, QueryRuntime::new())
}

fn int_array(s: &sfq_client::SharedSession, values: impl IntoIterator<Item = i64>) -> SArray {
    SArray::from_cells(
        s.clone(),
        values.into_iter().map(Cell::Integer).collect(),
        CellType::Integer,
    )
    .unwrap()
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Cell> {
    values.into_iter().map(Cell::Integer).collect()
}

#[test]
fn sum_reduces_to_a_single_cell() {
    let s = session();
    let xs = int_array(&s, 1..=5);
    assert_eq!(xs.sum().unwrap(), Cell::Integer(15));
}

#[test]
fn filter_and_apply_compose_lazily() {
    let s = session();
    let data = int_array(&s, [10, 20, 30, 40]);
    let mask = int_array(&s, [1, 0, 1, 1]);
    let out = data
        .filter(&mask)
        .unwrap()
        .apply(
            Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 2))),
            CellType::Integer,
        )
        .unwrap();
    // nothing ran yet; the filtered length is unknowable without running
    assert_eq!(out.len_hint().unwrap(), None);
    assert_eq!(out.to_vec().unwrap(), ints([20, 60, 80]));
}

#[test]
fn append_preserves_order_and_length_inference() {
    let s = session();
    let a = int_array(&s, [1, 2]);
    let b = int_array(&s, [3, 4, 5]);
    let both = a.append(&b).unwrap();
    assert_eq!(both.len_hint().unwrap(), Some(5));
    assert_eq!(both.to_vec().unwrap(), ints(1..=5));
}

#[test]
fn appending_mismatched_dtypes_is_rejected_at_plan_time() {
    let s = session();
    let a = int_array(&s, [1, 2]);
    let b = SArray::from_cells(
        s.clone(),
        vec![Cell::String("x".into())],
        CellType::String,
    )
    .unwrap();
    assert!(matches!(a.append(&b), Err(SfqError::InvalidPlan(_))));
}

#[test]
fn head_stops_the_pipeline_early() {
    let s = session();
    let xs = int_array(&s, 0..10_000);
    let head = xs.head(5).unwrap();
    assert_eq!(head, ints(0..5));
}

#[test]
fn materializing_rewrites_the_plan_tip_in_place() {
    let s = session();
    let xs = int_array(&s, 0..20).apply(
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() + 1))),
        CellType::Integer,
    )
    .unwrap();
    assert_eq!(read_node(xs.node()).kind, PlannerNodeType::Transform);
    let first = xs.to_vec().unwrap();
    // the handle now reads like stored data
    assert_eq!(read_node(xs.node()).kind, PlannerNodeType::SFrameSource);
    assert_eq!(xs.to_vec().unwrap(), first);
}

#[test]
fn zip_with_combines_two_columns_positionally() {
    let s = session();
    let a = int_array(&s, 0..6);
    let b = int_array(&s, 10..16);
    let sums = a
        .zip_with(
            &b,
            Arc::new(|l: &[Cell], r: &[Cell]| {
                Ok(Cell::Integer(
                    l[0].as_integer().unwrap() + r[0].as_integer().unwrap(),
                ))
            }),
            CellType::Integer,
        )
        .unwrap();
    assert_eq!(sums.to_vec().unwrap(), ints([10, 12, 14, 16, 18, 20]));
}

#[test]
fn external_lambda_transform_round_trips_through_the_channel() {
    let s = session();
    let channel = InProcessLambdaChannel::new();
    channel.register(
        "lambda x: x * 3",
        Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 3))),
    );
    s.set_lambda_channel(channel.clone());

    let xs = int_array(&s, 1..=4);
    let tripled = xs
        .apply_external("lambda x: x * 3", CellType::Integer, false, 0)
        .unwrap();
    assert_eq!(tripled.to_vec().unwrap(), ints([3, 6, 9, 12]));
    // every per-segment lambda was released after its stream ended
    assert_eq!(channel.active_count(), 0);
}

#[test]
fn dead_lambda_worker_fails_with_unreachable() {
    let s = session();
    let channel = InProcessLambdaChannel::new();
    channel.register("f", Arc::new(|row: &[Cell]| Ok(row[0].clone())));
    channel.set_unreachable(true);
    s.set_lambda_channel(channel);

    let xs = int_array(&s, 0..4);
    let out = xs.apply_external("f", CellType::Integer, false, 0).unwrap();
    assert!(matches!(out.to_vec(), Err(SfqError::Unreachable(_))));
}

#[test]
fn frame_select_and_column_round_trip() {
    let s = session();
    let frame = SFrame::from_columns(vec![
        ("a".to_string(), int_array(&s, [1, 2, 3])),
        ("b".to_string(), int_array(&s, [4, 5, 6])),
        ("c".to_string(), int_array(&s, [7, 8, 9])),
    ])
    .unwrap();

    let sel = frame.select_columns(&["c", "a"]).unwrap();
    assert_eq!(sel.column_names(), &["c", "a"]);
    let stored = sel.materialize().unwrap();
    assert_eq!(stored.column(0).to_vec().unwrap(), ints([7, 8, 9]));
    assert_eq!(stored.column(1).to_vec().unwrap(), ints([1, 2, 3]));

    // a frame's first column equals the array it was built from
    let first = frame.column("a").unwrap();
    assert_eq!(first.to_vec().unwrap(), ints([1, 2, 3]));
}

#[test]
fn frame_filter_append_and_apply_rows() {
    let s = session();
    let frame = SFrame::from_columns(vec![
        ("x".to_string(), int_array(&s, 0..6)),
        ("y".to_string(), int_array(&s, 10..16)),
    ])
    .unwrap();

    let mask = int_array(&s, [1, 0, 1, 0, 1, 0]);
    let odd_rows_dropped = frame.filter_by(&mask).unwrap();
    let stored = odd_rows_dropped.materialize().unwrap();
    assert_eq!(stored.column(0).to_vec().unwrap(), ints([0, 2, 4]));
    assert_eq!(stored.column(1).to_vec().unwrap(), ints([10, 12, 14]));

    let doubled = frame
        .apply_rows(
            Arc::new(|row: &[Cell]| {
                let x = row[0].as_integer().unwrap();
                let y = row[1].as_integer().unwrap();
                Ok(vec![Cell::Integer(x + y), Cell::Integer(x * y)])
            }),
            vec![CellType::Integer, CellType::Integer],
            vec!["sum".to_string(), "product".to_string()],
        )
        .unwrap();
    let head = doubled.head(2).unwrap();
    assert_eq!(head, vec![ints([10, 0]), ints([12, 11])]);

    let more = SFrame::from_columns(vec![
        ("x".to_string(), int_array(&s, [100])),
        ("y".to_string(), int_array(&s, [200])),
    ])
    .unwrap();
    let appended = frame.append(&more).unwrap();
    assert_eq!(appended.len_hint().unwrap(), Some(7));
    let stored = appended.materialize().unwrap();
    assert_eq!(
        stored.column(0).to_vec().unwrap(),
        ints([0, 1, 2, 3, 4, 5, 100])
    );

    // appending different column sets is a plan error
    let other = SFrame::from_columns(vec![("z".to_string(), int_array(&s, [1]))]).unwrap();
    assert!(matches!(
        frame.append(&other),
        Err(SfqError::InvalidPlan(_))
    ));
}

#[test]
fn add_column_widens_a_frame() {
    let s = session();
    let frame = SFrame::from_columns(vec![("x".to_string(), int_array(&s, 0..4))]).unwrap();
    let wide = frame
        .add_column("y", &int_array(&s, 10..14))
        .unwrap();
    assert_eq!(wide.column_names(), &["x", "y"]);
    let stored = wide.materialize().unwrap();
    assert_eq!(stored.column(1).to_vec().unwrap(), ints(10..14));
    assert!(matches!(
        wide.add_column("y", &int_array(&s, 0..4)),
        Err(SfqError::InvalidPlan(_))
    ));
}

#[test]
fn frames_persist_and_reopen_as_archives() {
    let s = session();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people");
    let frame = SFrame::from_columns(vec![
        ("id".to_string(), int_array(&s, 1..4)),
        ("score".to_string(), int_array(&s, [90, 85, 77])),
    ])
    .unwrap();
    frame.save(&path).unwrap();

    assert!(sfq_storage::is_directory_archive(&path));
    let reopened = SFrame::open(s.clone(), &path).unwrap();
    assert_eq!(reopened.column_names(), &["id", "score"]);
    assert_eq!(
        reopened.column("score").unwrap().to_vec().unwrap(),
        ints([90, 85, 77])
    );
}

#[test]
fn arrays_persist_and_reopen_as_archives() {
    let s = session();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let xs = int_array(&s, 0..9);
    xs.save(&path).unwrap();

    assert_eq!(
        sfq_storage::archive_kind(&path).unwrap(),
        sfq_storage::ArchiveKind::SArray
    );
    let reopened = SArray::open(s.clone(), &path).unwrap();
    assert_eq!(reopened.to_vec().unwrap(), ints(0..9));
}

#[test]
fn num_rows_materializes_only_when_unknown() {
    let s = session();
    let xs = int_array(&s, 0..12);
    assert_eq!(xs.num_rows().unwrap(), 12);
    assert_eq!(read_node(xs.node()).kind, PlannerNodeType::SArraySource);

    let mask = int_array(&s, [1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0]);
    let filtered = xs.filter(&mask).unwrap();
    assert_eq!(filtered.num_rows().unwrap(), 6);
}

#[test]
fn reduce_uses_custom_reducers() {
    let s = session();
    let xs = int_array(&s, [4, 8, 15, 16, 23, 42]);
    assert_eq!(
        xs.reduce(Arc::new(SumReducer)).unwrap(),
        Cell::Integer(108)
    );
    assert_eq!(
        xs.reduce(Arc::new(sfq_client::MinReducer)).unwrap(),
        Cell::Integer(4)
    );
    assert_eq!(
        xs.reduce(Arc::new(sfq_client::CountReducer)).unwrap(),
        Cell::Integer(6)
    );
}

#[test]
fn range_and_constant_sources() {
    let s = session();
    let r = SArray::range(s.clone(), 5, 9).unwrap();
    assert_eq!(r.to_vec().unwrap(), ints(5..9));
    let c = SArray::constant(s.clone(), Cell::String("hi".into()), 3);
    assert_eq!(
        c.to_vec().unwrap(),
        vec![
            Cell::String("hi".into()),
            Cell::String("hi".into()),
            Cell::String("hi".into())
        ]
    );
}
