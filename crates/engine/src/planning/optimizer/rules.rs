//! The rewrite rules, in registration order.
//!
//! Stage 0 runs for every materialization; stage 1 only for full
//! materializations (plan composition passes stop after stage 0).

use std::collections::BTreeMap;
use std::sync::Arc;

use sfq_common::{Cell, Result, SfqError};
use sfq_storage::{SArray, SFrame};

use crate::planning::node::{OpaqueParam, RowMapFn};
use crate::planning::optimizer::{
    column_param, frame_param, index_list_param, scalar_u64_param, OptEngine, OptNode, OptRule,
};
use crate::planning::registry::PlannerNodeType;

/// Rules grouped by stage.
pub struct RuleRegistry {
    stages: Vec<Vec<Box<dyn OptRule>>>,
}

impl RuleRegistry {
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_rules(&self, stage: usize) -> &[Box<dyn OptRule>] {
        &self.stages[stage]
    }
}

/// Every registered rule, in application order.
pub fn default_rules() -> RuleRegistry {
    RuleRegistry {
        stages: vec![
            vec![
                Box::new(EliminateIdentity),
                Box::new(MergeTransforms),
                Box::new(MergeProjects),
                Box::new(ProjectOnSource),
                Box::new(ProjectUnionCollapse),
                Box::new(LiftFilterBelowTransform),
                Box::new(MergeUnionOfSources),
            ],
            vec![Box::new(MergeContiguousAppendSources)],
        ],
    }
}

fn index_list_cell(indices: &[usize]) -> Cell {
    Cell::List(indices.iter().map(|&i| Cell::Integer(i as i64)).collect())
}

fn range_scalars(begin: u64, end: u64) -> BTreeMap<String, Cell> {
    let mut m = BTreeMap::new();
    m.insert("begin_index".into(), Cell::Integer(begin as i64));
    m.insert("end_index".into(), Cell::Integer(end as i64));
    m
}

/// Is this arena node a source covering the whole of its backing store?
fn full_range_source(n: &OptNode) -> Result<Option<FullSource>> {
    let begin = match n.kind {
        PlannerNodeType::SFrameSource | PlannerNodeType::SArraySource => {
            scalar_u64_param(n, "begin_index")?
        }
        _ => return Ok(None),
    };
    let end = scalar_u64_param(n, "end_index")?;
    match n.kind {
        PlannerNodeType::SFrameSource => {
            let frame = frame_param(n)?;
            if begin == 0 && end == frame.num_rows() {
                return Ok(Some(FullSource::Frame(frame.clone())));
            }
        }
        PlannerNodeType::SArraySource => {
            let column = column_param(n)?;
            if begin == 0 && end == column.len() {
                return Ok(Some(FullSource::Column(column.clone())));
            }
        }
        _ => {}
    }
    Ok(None)
}

enum FullSource {
    Frame(SFrame),
    Column(SArray),
}

impl FullSource {
    fn column(&self, idx: usize) -> SArray {
        match self {
            FullSource::Frame(f) => f.column(idx).clone(),
            FullSource::Column(c) => c.clone(),
        }
    }
}

/// `identity(x)` -> `x`.
struct EliminateIdentity;

impl OptRule for EliminateIdentity {
    fn description(&self) -> &'static str {
        "eliminate identity node"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Identity
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let input = eng.node(node).inputs[0];
        eng.replace_with(node, input);
        Ok(true)
    }
}

/// `transform(transform(x, f), g)` -> `transform(x, g . f)` when the inner
/// transform feeds nothing else.
struct MergeTransforms;

impl OptRule for MergeTransforms {
    fn description(&self) -> &'static str {
        "fuse adjacent row transforms"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Transform
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let inner = eng.node(node).inputs[0];
        if eng.node(inner).kind != PlannerNodeType::Transform || eng.num_consumers(inner) != 1 {
            return Ok(false);
        }
        let inner_f = map_fn(eng.node(inner))?;
        let outer_f = map_fn(eng.node(node))?;
        let composed: Arc<RowMapFn> = Arc::new(move |row| {
            let mid = inner_f(row)?;
            outer_f(std::slice::from_ref(&mid))
        });
        let out_types = eng.node(node).opaques.get("output_types").cloned().ok_or_else(
            || SfqError::Internal("transform node without output types".into()),
        )?;
        let grandchild = eng.node(inner).inputs[0];
        let mut opaques = BTreeMap::new();
        opaques.insert("function".to_string(), OpaqueParam::MapFn(composed));
        opaques.insert("output_types".to_string(), out_types);
        eng.set_node(node, PlannerNodeType::Transform, BTreeMap::new(), opaques);
        eng.set_inputs(node, vec![grandchild]);
        Ok(true)
    }
}

fn map_fn(n: &OptNode) -> Result<Arc<RowMapFn>> {
    match n.opaques.get("function") {
        Some(OpaqueParam::MapFn(f)) => Ok(f.clone()),
        _ => Err(SfqError::Internal("transform node without function".into())),
    }
}

/// `project(project(x, a), b)` -> `project(x, a[b])`.
struct MergeProjects;

impl OptRule for MergeProjects {
    fn description(&self) -> &'static str {
        "compose adjacent projections"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Project
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let inner = eng.node(node).inputs[0];
        if eng.node(inner).kind != PlannerNodeType::Project {
            return Ok(false);
        }
        let outer_idx = index_list_param(eng.node(node))?;
        let inner_idx = index_list_param(eng.node(inner))?;
        let composed: Vec<usize> = outer_idx.iter().map(|&i| inner_idx[i]).collect();
        let grandchild = eng.node(inner).inputs[0];
        let mut scalars = BTreeMap::new();
        scalars.insert("indices".to_string(), index_list_cell(&composed));
        eng.set_node(node, PlannerNodeType::Project, scalars, BTreeMap::new());
        eng.set_inputs(node, vec![grandchild]);
        Ok(true)
    }
}

/// `project(sframe_source)` -> `sframe_source` over the column subset;
/// `project(sarray_source, [0])` -> the source itself. Selecting columns of
/// a stored frame is a handle operation, not a data copy.
struct ProjectOnSource;

impl OptRule for ProjectOnSource {
    fn description(&self) -> &'static str {
        "narrow a source to the projected columns"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Project
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let src = eng.node(node).inputs[0];
        match eng.node(src).kind {
            PlannerNodeType::SFrameSource => {
                let indices = index_list_param(eng.node(node))?;
                let begin = scalar_u64_param(eng.node(src), "begin_index")?;
                let end = scalar_u64_param(eng.node(src), "end_index")?;
                let frame = frame_param(eng.node(src))?.clone();
                let selected = frame.select_columns(&indices)?;
                let mut opaques = BTreeMap::new();
                opaques.insert("frame".to_string(), OpaqueParam::Frame(selected));
                eng.set_node(
                    node,
                    PlannerNodeType::SFrameSource,
                    range_scalars(begin, end),
                    opaques,
                );
                eng.set_inputs(node, Vec::new());
                Ok(true)
            }
            PlannerNodeType::SArraySource => {
                let indices = index_list_param(eng.node(node))?;
                if indices != [0] {
                    return Ok(false);
                }
                eng.replace_with(node, src);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// `project(union(..))` -> `generalized_union_project` carrying a
/// pass-through table for projected columns that are full-range source
/// columns, so the planner can forward them without another scan.
struct ProjectUnionCollapse;

impl OptRule for ProjectUnionCollapse {
    fn description(&self) -> &'static str {
        "collapse projection over union"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Project
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let union = eng.node(node).inputs[0];
        if eng.node(union).kind != PlannerNodeType::Union {
            return Ok(false);
        }
        let indices = index_list_param(eng.node(node))?;
        let legs = eng.node(union).inputs.clone();
        let mut leg_cols = Vec::with_capacity(legs.len());
        for &leg in &legs {
            leg_cols.push(eng.num_columns(leg)?);
        }
        let mut mapping = BTreeMap::new();
        for (out_pos, &global) in indices.iter().enumerate() {
            let mut g = global;
            for (&leg, &ncols) in legs.iter().zip(&leg_cols) {
                if g < ncols {
                    if let Some(full) = full_range_source(eng.node(leg))? {
                        mapping.insert(out_pos, full.column(g));
                    }
                    break;
                }
                g -= ncols;
            }
        }
        let mut scalars = BTreeMap::new();
        scalars.insert("indices".to_string(), index_list_cell(&indices));
        let mut opaques = BTreeMap::new();
        opaques.insert(
            "direct_source_mapping".to_string(),
            OpaqueParam::SourceMapping(mapping),
        );
        let gup = eng.add_node(
            PlannerNodeType::GeneralizedUnionProject,
            scalars,
            opaques,
            legs,
        );
        eng.replace_with(node, gup);
        Ok(true)
    }
}

/// `logical_filter(transform(x), mask)` -> `transform(logical_filter(x, mask))`
/// when the transform feeds nothing else. The mask is built independently
/// of the transform, so filtering first is always legal and does strictly
/// less transform work.
struct LiftFilterBelowTransform;

impl OptRule for LiftFilterBelowTransform {
    fn description(&self) -> &'static str {
        "push filter below row transform"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::LogicalFilter
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let data = eng.node(node).inputs[0];
        let mask = eng.node(node).inputs[1];
        if eng.node(data).kind != PlannerNodeType::Transform || eng.num_consumers(data) != 1 {
            return Ok(false);
        }
        let transform_input = eng.node(data).inputs[0];
        let scalars = eng.node(data).scalars.clone();
        let opaques = eng.node(data).opaques.clone();
        let lowered = eng.add_node(
            PlannerNodeType::LogicalFilter,
            BTreeMap::new(),
            BTreeMap::new(),
            vec![transform_input, mask],
        );
        eng.set_node(node, PlannerNodeType::Transform, scalars, opaques);
        eng.set_inputs(node, vec![lowered]);
        Ok(true)
    }
}

/// A union whose legs are all full-range stored sources is just a wider
/// stored frame.
struct MergeUnionOfSources;

impl OptRule for MergeUnionOfSources {
    fn description(&self) -> &'static str {
        "merge union of stored sources"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Union
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let legs = eng.node(node).inputs.clone();
        let mut combined: Option<SFrame> = None;
        for &leg in &legs {
            let Some(full) = full_range_source(eng.node(leg))? else {
                return Ok(false);
            };
            let next = match full {
                FullSource::Frame(f) => f,
                FullSource::Column(c) => {
                    SFrame::from_columns(vec![c], vec!["X1".to_string()])?
                }
            };
            combined = Some(match combined {
                None => next,
                Some(acc) => acc.with_columns_from(&next)?,
            });
        }
        let Some(frame) = combined else {
            return Ok(false);
        };
        let end = frame.num_rows();
        let mut opaques = BTreeMap::new();
        opaques.insert("frame".to_string(), OpaqueParam::Frame(frame));
        eng.set_node(
            node,
            PlannerNodeType::SFrameSource,
            range_scalars(0, end),
            opaques,
        );
        eng.set_inputs(node, Vec::new());
        Ok(true)
    }
}

/// `append(source[a, b), source[b, c))` over one backing store ->
/// `source[a, c)`.
struct MergeContiguousAppendSources;

impl OptRule for MergeContiguousAppendSources {
    fn description(&self) -> &'static str {
        "merge append of contiguous source ranges"
    }

    fn applies_to(&self, kind: PlannerNodeType) -> bool {
        kind == PlannerNodeType::Append
    }

    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool> {
        let top = eng.node(node).inputs[0];
        let bottom = eng.node(node).inputs[1];
        let (top_n, bottom_n) = (eng.node(top), eng.node(bottom));
        if top_n.kind != bottom_n.kind {
            return Ok(false);
        }
        match top_n.kind {
            PlannerNodeType::SFrameSource => {
                if frame_param(top_n)? != frame_param(bottom_n)? {
                    return Ok(false);
                }
            }
            PlannerNodeType::SArraySource => {
                if !column_param(top_n)?.ptr_eq(column_param(bottom_n)?) {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
        let top_end = scalar_u64_param(top_n, "end_index")?;
        let bottom_begin = scalar_u64_param(bottom_n, "begin_index")?;
        if top_end != bottom_begin {
            return Ok(false);
        }
        let begin = scalar_u64_param(top_n, "begin_index")?;
        let end = scalar_u64_param(bottom_n, "end_index")?;
        let kind = top_n.kind;
        let opaques = top_n.opaques.clone();
        eng.set_node(node, kind, range_scalars(begin, end), opaques);
        eng.set_inputs(node, Vec::new());
        Ok(true)
    }
}
