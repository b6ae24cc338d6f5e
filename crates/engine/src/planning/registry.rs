//! The closed operator registry: node kinds, their static attributes, and
//! the parallel-slicing predicates the planner schedules by.

use std::collections::HashMap;

use crate::planning::node::{node_key, read_node, NodeRef};

/// Every operator kind the engine knows.
///
/// `Identity` is a planning-only kind: the optimizer erases it and the
/// operator factory refuses to instantiate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlannerNodeType {
    Constant,
    Append,
    BinaryTransform,
    LogicalFilter,
    Project,
    Range,
    SArraySource,
    SFrameSource,
    Transform,
    LambdaTransform,
    GeneralizedTransform,
    Union,
    GeneralizedUnionProject,
    Reduce,
    Identity,
}

impl PlannerNodeType {
    pub fn name(self) -> &'static str {
        match self {
            PlannerNodeType::Constant => "constant",
            PlannerNodeType::Append => "append",
            PlannerNodeType::BinaryTransform => "binary_transform",
            PlannerNodeType::LogicalFilter => "logical_filter",
            PlannerNodeType::Project => "project",
            PlannerNodeType::Range => "range",
            PlannerNodeType::SArraySource => "sarray_source",
            PlannerNodeType::SFrameSource => "sframe_source",
            PlannerNodeType::Transform => "transform",
            PlannerNodeType::LambdaTransform => "lambda_transform",
            PlannerNodeType::GeneralizedTransform => "generalized_transform",
            PlannerNodeType::Union => "union",
            PlannerNodeType::GeneralizedUnionProject => "generalized_union_project",
            PlannerNodeType::Reduce => "reduce",
            PlannerNodeType::Identity => "identity",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use PlannerNodeType::*;
        Some(match name {
            "constant" => Constant,
            "append" => Append,
            "binary_transform" => BinaryTransform,
            "logical_filter" => LogicalFilter,
            "project" => Project,
            "range" => Range,
            "sarray_source" => SArraySource,
            "sframe_source" => SFrameSource,
            "transform" => Transform,
            "lambda_transform" => LambdaTransform,
            "generalized_transform" => GeneralizedTransform,
            "union" => Union,
            "generalized_union_project" => GeneralizedUnionProject,
            "reduce" => Reduce,
            "identity" => Identity,
            _ => return None,
        })
    }
}

/// Input arity of an operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArity {
    Exact(usize),
    AtLeast(usize),
}

impl InputArity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            InputArity::Exact(k) => n == k,
            InputArity::AtLeast(k) => n >= k,
        }
    }
}

/// Static per-kind flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOperatorAttributes {
    /// Produces rows from storage or a constant; has no inputs.
    pub source: bool,
    /// Exactly one output row per input row.
    pub linear: bool,
    /// At most one output row per input row, no expansion.
    pub sublinear: bool,
    /// Advances every input in lock step.
    pub same_rate: bool,
    /// The node's output may be split by source segments and produced
    /// independently per segment.
    pub sliceable: bool,
    pub num_inputs: InputArity,
}

/// The attribute table for a kind.
pub fn attributes_of(kind: PlannerNodeType) -> QueryOperatorAttributes {
    use InputArity::*;
    use PlannerNodeType::*;
    let attr = |source, linear, sublinear, same_rate, sliceable, num_inputs| {
        QueryOperatorAttributes {
            source,
            linear,
            sublinear,
            same_rate,
            sliceable,
            num_inputs,
        }
    };
    match kind {
        Constant | Range | SArraySource | SFrameSource => {
            attr(true, false, false, false, true, Exact(0))
        }
        Transform | GeneralizedTransform | LambdaTransform | Project | Identity => {
            attr(false, true, false, true, true, Exact(1))
        }
        BinaryTransform => attr(false, true, false, true, true, Exact(2)),
        Union => attr(false, true, false, true, true, AtLeast(2)),
        GeneralizedUnionProject => attr(false, true, false, true, true, AtLeast(1)),
        // drains its inputs one after the other, so per-segment clones would
        // interleave the two inputs' rows
        Append => attr(false, true, false, false, false, Exact(2)),
        LogicalFilter => attr(false, false, true, true, true, Exact(2)),
        // a sliced reduce would yield one partial per segment instead of the
        // combined fold; the planner runs its own per-segment fold instead
        Reduce => attr(false, false, true, true, false, Exact(1)),
    }
}

pub fn is_source_node(node: &NodeRef) -> bool {
    attributes_of(read_node(node).kind).source
}

pub fn is_linear_transform(node: &NodeRef) -> bool {
    attributes_of(read_node(node).kind).linear
}

pub fn is_sublinear_transform(node: &NodeRef) -> bool {
    attributes_of(read_node(node).kind).sublinear
}

pub fn consumes_inputs_at_same_rate(node: &NodeRef) -> bool {
    attributes_of(read_node(node).kind).same_rate
}

/// Parallel-slicing codes of a node's inputs.
///
/// Sources are code 1. A same-rate node inherits the single distinct
/// non-source code of its inputs, if any; a sublinear node's own output is
/// stamped with a fresh code because its rows are no longer aligned with the
/// source segmentation that produced them.
pub fn parallel_slicable_codes(node: &NodeRef) -> Vec<u64> {
    let mut memo = HashMap::new();
    let mut next = 2u64;
    read_node(node)
        .inputs
        .iter()
        .map(|i| slicing_code(i, &mut memo, &mut next))
        .collect()
}

fn slicing_code(node: &NodeRef, memo: &mut HashMap<usize, u64>, next: &mut u64) -> u64 {
    let key = node_key(node);
    if let Some(&c) = memo.get(&key) {
        return c;
    }
    let (kind, inputs) = {
        let n = read_node(node);
        (n.kind, n.inputs.clone())
    };
    let attrs = attributes_of(kind);
    let code = if attrs.source {
        1
    } else {
        let input_codes: Vec<u64> = inputs
            .iter()
            .map(|i| slicing_code(i, memo, next))
            .collect();
        if attrs.sublinear || !attrs.same_rate {
            let c = *next;
            *next += 1;
            c
        } else {
            let mut non_source: Option<u64> = None;
            let mut conflict = false;
            for &c in &input_codes {
                if c != 1 {
                    match non_source {
                        None => non_source = Some(c),
                        Some(prev) if prev != c => conflict = true,
                        Some(_) => {}
                    }
                }
            }
            if conflict {
                let c = *next;
                *next += 1;
                c
            } else {
                non_source.unwrap_or(1)
            }
        }
    };
    memo.insert(key, code);
    code
}

/// True when the whole dependency DAG of `node` can be cloned per segment
/// and run independently: every non-source node consumes in lock step, is
/// sliceable, and sees one uniform slicing code across its inputs.
pub fn is_parallel_slicable(node: &NodeRef) -> bool {
    let mut memo = HashMap::new();
    let mut next = 2u64;
    let mut seen = HashMap::new();
    slicable_walk(node, &mut memo, &mut next, &mut seen)
}

fn slicable_walk(
    node: &NodeRef,
    memo: &mut HashMap<usize, u64>,
    next: &mut u64,
    seen: &mut HashMap<usize, bool>,
) -> bool {
    let key = node_key(node);
    if let Some(&ok) = seen.get(&key) {
        return ok;
    }
    let (kind, inputs) = {
        let n = read_node(node);
        (n.kind, n.inputs.clone())
    };
    let attrs = attributes_of(kind);
    let ok = if attrs.source {
        true
    } else if !attrs.sliceable || !attrs.same_rate {
        false
    } else {
        let codes: Vec<u64> = inputs.iter().map(|i| slicing_code(i, memo, next)).collect();
        let uniform = codes.windows(2).all(|w| w[0] == w[1]);
        uniform && inputs.iter().all(|i| slicable_walk(i, memo, next, seen))
    };
    seen.insert(key, ok);
    ok
}
