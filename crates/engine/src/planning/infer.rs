//! Pure, memoized inference over the planner DAG: output types, row counts,
//! column counts, and dependency sizes. Answers depend only on node kind,
//! parameters, and inputs, so structurally equal plans infer identically.

use std::collections::HashMap;

use sfq_common::{CellType, Result, SfqError};

use crate::planning::node::{node_key, read_node, NodeRef};
use crate::planning::registry::PlannerNodeType;

/// Output cell types, one per column.
pub fn infer_dtype(node: &NodeRef) -> Result<Vec<CellType>> {
    let mut memo = HashMap::new();
    dtype_walk(node, &mut memo)
}

fn dtype_walk(node: &NodeRef, memo: &mut HashMap<usize, Vec<CellType>>) -> Result<Vec<CellType>> {
    let key = node_key(node);
    if let Some(t) = memo.get(&key) {
        return Ok(t.clone());
    }
    let n = read_node(node);
    let kind = n.kind;
    let inputs = n.inputs.clone();
    let types = match kind {
        PlannerNodeType::Constant => vec![n.scalar("value")?.type_of()],
        PlannerNodeType::Range => vec![CellType::Integer],
        PlannerNodeType::SArraySource => vec![n.column("column")?.dtype()],
        PlannerNodeType::SFrameSource => n.frame("frame")?.column_dtypes(),
        PlannerNodeType::Transform
        | PlannerNodeType::BinaryTransform
        | PlannerNodeType::GeneralizedTransform
        | PlannerNodeType::LambdaTransform
        | PlannerNodeType::Reduce => n.types("output_types")?.to_vec(),
        PlannerNodeType::Project => {
            let indices = n.scalar_index_list("indices")?;
            drop(n);
            let input = dtype_walk(&inputs[0], memo)?;
            indices
                .iter()
                .map(|&i| {
                    input.get(i).copied().ok_or_else(|| {
                        SfqError::Internal(format!(
                            "projection index {i} out of range ({} columns)",
                            input.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        }
        PlannerNodeType::Union => {
            drop(n);
            let mut all = Vec::new();
            for input in &inputs {
                all.extend(dtype_walk(input, memo)?);
            }
            all
        }
        PlannerNodeType::GeneralizedUnionProject => {
            let indices = n.scalar_index_list("indices")?;
            drop(n);
            let mut all = Vec::new();
            for input in &inputs {
                all.extend(dtype_walk(input, memo)?);
            }
            indices
                .iter()
                .map(|&i| {
                    all.get(i).copied().ok_or_else(|| {
                        SfqError::Internal(format!(
                            "union-project index {i} out of range ({} columns)",
                            all.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        }
        PlannerNodeType::Append | PlannerNodeType::LogicalFilter | PlannerNodeType::Identity => {
            drop(n);
            dtype_walk(&inputs[0], memo)?
        }
    };
    memo.insert(key, types.clone());
    Ok(types)
}

/// Output row count, `None` when it cannot be known before execution.
pub fn infer_length(node: &NodeRef) -> Result<Option<u64>> {
    let mut memo = HashMap::new();
    length_walk(node, &mut memo)
}

fn length_walk(node: &NodeRef, memo: &mut HashMap<usize, Option<u64>>) -> Result<Option<u64>> {
    let key = node_key(node);
    if let Some(l) = memo.get(&key) {
        return Ok(*l);
    }
    let n = read_node(node);
    let kind = n.kind;
    let inputs = n.inputs.clone();
    let len = match kind {
        PlannerNodeType::Constant => Some(n.scalar_u64("size")?),
        PlannerNodeType::Range
        | PlannerNodeType::SArraySource
        | PlannerNodeType::SFrameSource => {
            let begin = n.scalar_u64("begin_index")?;
            let end = n.scalar_u64("end_index")?;
            Some(end - begin)
        }
        PlannerNodeType::Reduce => Some(1),
        PlannerNodeType::LogicalFilter => None,
        PlannerNodeType::Append => {
            drop(n);
            let a = length_walk(&inputs[0], memo)?;
            let b = length_walk(&inputs[1], memo)?;
            match (a, b) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            }
        }
        PlannerNodeType::Transform
        | PlannerNodeType::BinaryTransform
        | PlannerNodeType::GeneralizedTransform
        | PlannerNodeType::LambdaTransform
        | PlannerNodeType::Project
        | PlannerNodeType::Union
        | PlannerNodeType::GeneralizedUnionProject
        | PlannerNodeType::Identity => {
            drop(n);
            length_walk(&inputs[0], memo)?
        }
    };
    memo.insert(key, len);
    Ok(len)
}

/// Number of output columns.
pub fn infer_num_columns(node: &NodeRef) -> Result<usize> {
    let mut memo = HashMap::new();
    ncols_walk(node, &mut memo)
}

fn ncols_walk(node: &NodeRef, memo: &mut HashMap<usize, usize>) -> Result<usize> {
    let key = node_key(node);
    if let Some(c) = memo.get(&key) {
        return Ok(*c);
    }
    let n = read_node(node);
    let kind = n.kind;
    let inputs = n.inputs.clone();
    let ncols = match kind {
        PlannerNodeType::Constant | PlannerNodeType::Range | PlannerNodeType::SArraySource => 1,
        PlannerNodeType::SFrameSource => n.frame("frame")?.num_columns(),
        PlannerNodeType::Transform
        | PlannerNodeType::BinaryTransform
        | PlannerNodeType::LambdaTransform
        | PlannerNodeType::Reduce => 1,
        PlannerNodeType::GeneralizedTransform => n.types("output_types")?.len(),
        PlannerNodeType::Project | PlannerNodeType::GeneralizedUnionProject => {
            n.scalar_index_list("indices")?.len()
        }
        PlannerNodeType::Union => {
            drop(n);
            let mut total = 0;
            for input in &inputs {
                total += ncols_walk(input, memo)?;
            }
            total
        }
        PlannerNodeType::Append | PlannerNodeType::LogicalFilter | PlannerNodeType::Identity => {
            drop(n);
            ncols_walk(&inputs[0], memo)?
        }
    };
    memo.insert(key, ncols);
    Ok(ncols)
}

/// Number of distinct nodes in the dependency DAG, `node` included.
pub fn infer_num_dependency_nodes(node: &NodeRef) -> usize {
    let mut seen = HashMap::new();
    deps_walk(node, &mut seen);
    seen.len()
}

fn deps_walk(node: &NodeRef, seen: &mut HashMap<usize, ()>) {
    if seen.insert(node_key(node), ()).is_some() {
        return;
    }
    let inputs = read_node(node).inputs.clone();
    for input in &inputs {
        deps_walk(input, seen);
    }
}
