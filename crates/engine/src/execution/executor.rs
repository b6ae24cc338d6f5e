//! The subplan executor: runs per-segment clones of a linear plan tip to
//! exhaustion on the worker pool, streaming blocks into a frame writer or a
//! caller-supplied callback.
//!
//! One worker per segment; the first failure wins, peers observe the shared
//! stop flag at block boundaries, and partially written output is discarded
//! with the scratch directory.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sfq_common::{CancelFlag, Cell, Result, SfqError};
use sfq_storage::{FrameSegmentMeta, FrameWriter, SFrame};

use crate::execution::batch::RowBatch;
use crate::execution::exec_node::{ExecutionNode, InputEdge};
use crate::execution::operators::reduce::{fold_batch, ReduceFunction};
use crate::execution::operators::planner_node_to_operator;
use crate::planning::infer::{infer_dtype, infer_num_columns};
use crate::planning::node::{node_key, read_node, NodeRef};

/// Sink callback: `(segment, block) -> stop?`. Returning `true` tells every
/// worker the sink has enough.
pub type WriteCallback = Arc<dyn Fn(usize, &RowBatch) -> Result<bool> + Send + Sync>;

/// Build the execution-node graph mirroring a planner sub-DAG and register
/// the driver as a consumer of its root.
pub fn build_execution_graph(
    tip: &NodeRef,
    cancel: CancelFlag,
    batch_size: usize,
) -> Result<(Rc<ExecutionNode>, usize)> {
    let mut memo = HashMap::new();
    let root = build_node(tip, &mut memo, &cancel, batch_size)?;
    let consumer_id = root.register_consumer();
    Ok((root, consumer_id))
}

fn build_node(
    node: &NodeRef,
    memo: &mut HashMap<usize, Rc<ExecutionNode>>,
    cancel: &CancelFlag,
    batch_size: usize,
) -> Result<Rc<ExecutionNode>> {
    let key = node_key(node);
    if let Some(n) = memo.get(&key) {
        return Ok(n.clone());
    }
    let inputs = read_node(node).inputs.clone();
    let mut edges = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let peer = build_node(input, memo, cancel, batch_size)?;
        let consumer_id = peer.register_consumer();
        edges.push(InputEdge {
            node: peer,
            consumer_id,
        });
    }
    let op = planner_node_to_operator(node)?;
    let exec = ExecutionNode::new(op, edges, cancel.clone(), batch_size);
    memo.insert(key, exec.clone());
    Ok(exec)
}

/// Run one clone per segment and assemble the outputs, in segment order,
/// into a frame.
pub fn run_to_frame(
    segments: &[NodeRef],
    column_names: Vec<String>,
    batch_size: usize,
    cancel: &CancelFlag,
) -> Result<SFrame> {
    let tip = segments
        .first()
        .ok_or_else(|| SfqError::Internal("executor needs at least one segment".into()))?;
    let ncols = infer_num_columns(tip)?;
    let dtypes = infer_dtype(tip)?;
    let mut writer = FrameWriter::new_scratch(ncols, segments.len())?;
    writer.set_dtypes(&dtypes)?;
    let mut seg_writers = Vec::with_capacity(segments.len());
    for s in 0..segments.len() {
        seg_writers.push(writer.segment_writer(s)?);
    }

    tracing::debug!(segments = segments.len(), columns = ncols, "running subplan");

    let stop = AtomicBool::new(false);
    let failure: Mutex<Option<SfqError>> = Mutex::new(None);
    let results: Mutex<Vec<Option<FrameSegmentMeta>>> =
        Mutex::new((0..segments.len()).map(|_| None).collect());

    rayon::scope(|scope| {
        for (s, (node, mut seg_writer)) in
            segments.iter().cloned().zip(seg_writers.drain(..)).enumerate()
        {
            let stop = &stop;
            let failure = &failure;
            let results = &results;
            let cancel = cancel.clone();
            scope.spawn(move |_| {
                let outcome = (|| -> Result<FrameSegmentMeta> {
                    let (root, cid) = build_execution_graph(&node, cancel, batch_size)?;
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            return Err(SfqError::Cancelled);
                        }
                        match root.get_next(cid, false)? {
                            Some(block) => seg_writer.write_columns(block.columns())?,
                            None => break,
                        }
                    }
                    seg_writer.finish()
                })();
                match outcome {
                    Ok(meta) => {
                        results.lock().expect("results lock poisoned")[s] = Some(meta);
                    }
                    Err(e) => {
                        stop.store(true, Ordering::SeqCst);
                        let mut f = failure.lock().expect("failure lock poisoned");
                        // the first real failure wins; peers unwound by the
                        // stop flag report Cancelled
                        if f.is_none() || matches!(*f, Some(SfqError::Cancelled)) {
                            *f = Some(e);
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = failure.into_inner().expect("failure lock poisoned") {
        return Err(e);
    }
    let metas = results
        .into_inner()
        .expect("results lock poisoned")
        .into_iter()
        .map(|m| m.ok_or_else(|| SfqError::Internal("a segment produced no result".into())))
        .collect::<Result<Vec<_>>>()?;
    writer.close(metas, column_names)
}

/// Run one clone per segment, streaming every block to `callback`.
pub fn run_to_callback(
    segments: &[NodeRef],
    batch_size: usize,
    cancel: &CancelFlag,
    callback: &WriteCallback,
) -> Result<()> {
    let stop = AtomicBool::new(false);
    let failure: Mutex<Option<SfqError>> = Mutex::new(None);

    rayon::scope(|scope| {
        for (s, node) in segments.iter().cloned().enumerate() {
            let stop = &stop;
            let failure = &failure;
            let cancel = cancel.clone();
            let callback = callback.clone();
            scope.spawn(move |_| {
                let outcome = (|| -> Result<()> {
                    let (root, cid) = build_execution_graph(&node, cancel, batch_size)?;
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        match root.get_next(cid, false)? {
                            Some(block) => {
                                if callback(s, &block)? {
                                    stop.store(true, Ordering::SeqCst);
                                    return Ok(());
                                }
                            }
                            None => return Ok(()),
                        }
                    }
                })();
                if let Err(e) = outcome {
                    stop.store(true, Ordering::SeqCst);
                    let mut f = failure.lock().expect("failure lock poisoned");
                    if f.is_none() || matches!(*f, Some(SfqError::Cancelled)) {
                        *f = Some(e);
                    }
                }
            });
        }
    });

    match failure.into_inner().expect("failure lock poisoned") {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Fold one clone per segment, then combine the per-segment states
/// serially, in segment order, on the driver.
pub fn run_reduce(
    segments: &[NodeRef],
    reducer: Arc<dyn ReduceFunction>,
    batch_size: usize,
    cancel: &CancelFlag,
) -> Result<Cell> {
    let stop = AtomicBool::new(false);
    let failure: Mutex<Option<SfqError>> = Mutex::new(None);
    let states: Mutex<Vec<Option<Cell>>> =
        Mutex::new((0..segments.len()).map(|_| None).collect());

    rayon::scope(|scope| {
        for (s, node) in segments.iter().cloned().enumerate() {
            let stop = &stop;
            let failure = &failure;
            let states = &states;
            let cancel = cancel.clone();
            let reducer = reducer.clone();
            scope.spawn(move |_| {
                let outcome = (|| -> Result<Cell> {
                    let (root, cid) = build_execution_graph(&node, cancel, batch_size)?;
                    let mut state = reducer.initial();
                    let mut scratch = Vec::new();
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            return Err(SfqError::Cancelled);
                        }
                        match root.get_next(cid, false)? {
                            Some(block) => {
                                fold_batch(reducer.as_ref(), &mut state, &block, &mut scratch)?
                            }
                            None => return Ok(state),
                        }
                    }
                })();
                match outcome {
                    Ok(state) => {
                        states.lock().expect("states lock poisoned")[s] = Some(state);
                    }
                    Err(e) => {
                        stop.store(true, Ordering::SeqCst);
                        let mut f = failure.lock().expect("failure lock poisoned");
                        if f.is_none() || matches!(*f, Some(SfqError::Cancelled)) {
                            *f = Some(e);
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = failure.into_inner().expect("failure lock poisoned") {
        return Err(e);
    }
    let mut combined = reducer.initial();
    for state in states.into_inner().expect("states lock poisoned") {
        let state =
            state.ok_or_else(|| SfqError::Internal("a segment produced no fold state".into()))?;
        reducer.combine(&mut combined, &state)?;
    }
    Ok(combined)
}
