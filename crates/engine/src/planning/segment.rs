//! Per-segment plan cloning.
//!
//! A parallel-slicable plan runs as S independent clones, one per output
//! segment; cloning narrows every source node's row range to the segment's
//! slice and deep-copies the rest, memoized so shared subtrees stay shared
//! within a clone.

use std::collections::HashMap;

use sfq_common::Result;

use crate::planning::node::{node_key, read_node, NodeRef, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType};

/// Rows `[begin, end)` restricted to segment `segment` of `num_segments`,
/// remainder rows spread over the leading segments.
pub fn slice_range(begin: u64, end: u64, segment: usize, num_segments: usize) -> (u64, u64) {
    let len = end - begin;
    let base = len / num_segments as u64;
    let extra = len % num_segments as u64;
    let seg = segment as u64;
    let start = begin + seg * base + seg.min(extra);
    let size = base + u64::from(seg < extra);
    (start, start + size)
}

/// Clone the plan under `node` with every source narrowed to `segment`.
pub fn make_segmented_graph(
    node: &NodeRef,
    segment: usize,
    num_segments: usize,
    memo: &mut HashMap<usize, NodeRef>,
) -> Result<NodeRef> {
    let key = node_key(node);
    if let Some(n) = memo.get(&key) {
        return Ok(n.clone());
    }
    let contents = read_node(node).clone();
    let cloned = if attributes_of(contents.kind).source {
        let mut c = contents;
        match c.kind {
            PlannerNodeType::Constant => {
                let size = c.scalar_u64("size")?;
                let (b, e) = slice_range(0, size, segment, num_segments);
                c.scalars.insert("size".into(), ((e - b) as i64).into());
            }
            _ => {
                let begin = c.scalar_u64("begin_index")?;
                let end = c.scalar_u64("end_index")?;
                let (b, e) = slice_range(begin, end, segment, num_segments);
                c.scalars.insert("begin_index".into(), (b as i64).into());
                c.scalars.insert("end_index".into(), (e as i64).into());
            }
        }
        c.into_ref()
    } else {
        let mut inputs = Vec::with_capacity(contents.inputs.len());
        for input in &contents.inputs {
            inputs.push(make_segmented_graph(input, segment, num_segments, memo)?);
        }
        PlannerNode {
            inputs,
            ..contents
        }
        .into_ref()
    };
    memo.insert(key, cloned.clone());
    Ok(cloned)
}
