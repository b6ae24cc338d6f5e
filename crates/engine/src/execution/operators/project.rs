//! Column-shape operators: projection, horizontal union, and the fused
//! union-project with source pass-through.

use std::collections::BTreeMap;

use sfq_common::{Result, SfqError};
use sfq_storage::SArray;

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, QueryOperator};
use crate::planning::infer::{infer_length, infer_num_columns};
use crate::planning::node::{NodeRef, OpaqueParam, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

// ---- planner-node constructors ----

/// Column subset/reorder of `input`.
pub fn make_project_node(input: NodeRef, indices: Vec<usize>) -> Result<NodeRef> {
    let ncols = infer_num_columns(&input)?;
    for &i in &indices {
        if i >= ncols {
            return Err(SfqError::InvalidPlan(format!(
                "projection index {i} out of range ({ncols} columns)"
            )));
        }
    }
    if indices.is_empty() {
        return Err(SfqError::InvalidPlan(
            "projection must keep at least one column".into(),
        ));
    }
    let inputs = vec![input];
    check_arity(PlannerNodeType::Project, &inputs)?;
    Ok(PlannerNode::new(PlannerNodeType::Project)
        .with_scalar("indices", index_list(&indices))
        .with_inputs(inputs)
        .into_ref())
}

/// Horizontal concat of equal-length inputs.
pub fn make_union_node(inputs: Vec<NodeRef>) -> Result<NodeRef> {
    check_arity(PlannerNodeType::Union, &inputs)?;
    check_equal_lengths(&inputs)?;
    Ok(PlannerNode::new(PlannerNodeType::Union)
        .with_inputs(inputs)
        .into_ref())
}

/// Union + projection in one node.
///
/// `indices` select from the concatenated input columns.
/// `direct_source_mapping` maps output column positions onto backing
/// columns that cover the full projected range, letting the planner forward
/// them without streaming the rows again.
pub fn make_generalized_union_project_node(
    inputs: Vec<NodeRef>,
    indices: Vec<usize>,
    direct_source_mapping: BTreeMap<usize, SArray>,
) -> Result<NodeRef> {
    check_arity(PlannerNodeType::GeneralizedUnionProject, &inputs)?;
    check_equal_lengths(&inputs)?;
    let mut total = 0;
    for input in &inputs {
        total += infer_num_columns(input)?;
    }
    for &i in &indices {
        if i >= total {
            return Err(SfqError::InvalidPlan(format!(
                "union-project index {i} out of range ({total} columns)"
            )));
        }
    }
    if indices.is_empty() {
        return Err(SfqError::InvalidPlan(
            "union-project must keep at least one column".into(),
        ));
    }
    for &pos in direct_source_mapping.keys() {
        if pos >= indices.len() {
            return Err(SfqError::InvalidPlan(format!(
                "pass-through position {pos} out of range ({} output columns)",
                indices.len()
            )));
        }
    }
    Ok(PlannerNode::new(PlannerNodeType::GeneralizedUnionProject)
        .with_scalar("indices", index_list(&indices))
        .with_opaque(
            "direct_source_mapping",
            OpaqueParam::SourceMapping(direct_source_mapping),
        )
        .with_inputs(inputs)
        .into_ref())
}

fn index_list(indices: &[usize]) -> sfq_common::Cell {
    sfq_common::Cell::List(
        indices
            .iter()
            .map(|&i| sfq_common::Cell::Integer(i as i64))
            .collect(),
    )
}

fn check_equal_lengths(inputs: &[NodeRef]) -> Result<()> {
    let mut known: Option<u64> = None;
    for input in inputs {
        if let Some(len) = infer_length(input)? {
            match known {
                None => known = Some(len),
                Some(k) if k != len => {
                    return Err(SfqError::InvalidPlan(format!(
                        "union inputs have {k} and {len} rows"
                    )))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

// ---- operators ----

pub(crate) fn project_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(ProjectOp {
        indices: n.scalar_index_list("indices")?,
    }))
}

pub(crate) fn union_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(UnionOp {
        num_inputs: n.inputs.len(),
    }))
}

pub(crate) fn generalized_union_project_operator(
    n: &PlannerNode,
) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(GeneralizedUnionProjectOp {
        num_inputs: n.inputs.len(),
        indices: n.scalar_index_list("indices")?,
    }))
}

struct ProjectOp {
    indices: Vec<usize>,
}

impl QueryOperator for ProjectOp {
    fn name(&self) -> &'static str {
        "project"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Project)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if ctx.should_skip() {
            let Some(batch) = ctx.skip_next(0)? else {
                return Ok(());
            };
            ctx.emit(RowBatch::placeholder(self.indices.len(), batch.num_rows()))?;
            return Ok(());
        }
        let Some(batch) = ctx.get_next(0)? else {
            return Ok(());
        };
        let columns = self
            .indices
            .iter()
            .map(|&i| batch.column(i).to_vec())
            .collect();
        ctx.emit(RowBatch::from_columns(columns)?)?;
        Ok(())
    }
}

/// Pull one block from every input, in lock step.
fn pull_all(
    ctx: &mut QueryContext<'_>,
    num_inputs: usize,
) -> Result<Option<Vec<std::rc::Rc<RowBatch>>>> {
    let mut blocks = Vec::with_capacity(num_inputs);
    for i in 0..num_inputs {
        let b = if ctx.should_skip() {
            ctx.skip_next(i)?
        } else {
            ctx.get_next(i)?
        };
        blocks.push(b);
    }
    if blocks.iter().all(Option::is_none) {
        return Ok(None);
    }
    let blocks: Vec<_> = blocks
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| SfqError::Internal("union inputs ended at different lengths".into()))?;
    let rows = blocks[0].num_rows();
    for b in &blocks {
        if b.num_rows() != rows {
            return Err(SfqError::Internal(format!(
                "union pulled misaligned blocks ({} vs {rows} rows)",
                b.num_rows()
            )));
        }
    }
    Ok(Some(blocks))
}

struct UnionOp {
    num_inputs: usize,
}

impl QueryOperator for UnionOp {
    fn name(&self) -> &'static str {
        "union"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Union)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let Some(blocks) = pull_all(ctx, self.num_inputs)? else {
            return Ok(());
        };
        let mut columns = Vec::new();
        for b in &blocks {
            for c in 0..b.num_columns() {
                columns.push(b.column(c).to_vec());
            }
        }
        ctx.emit(RowBatch::from_columns(columns)?)?;
        Ok(())
    }
}

struct GeneralizedUnionProjectOp {
    num_inputs: usize,
    indices: Vec<usize>,
}

impl QueryOperator for GeneralizedUnionProjectOp {
    fn name(&self) -> &'static str {
        "generalized_union_project"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::GeneralizedUnionProject)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let Some(blocks) = pull_all(ctx, self.num_inputs)? else {
            return Ok(());
        };
        let mut concat: Vec<&[sfq_common::Cell]> = Vec::new();
        for b in &blocks {
            for c in 0..b.num_columns() {
                concat.push(b.column(c));
            }
        }
        let columns = self
            .indices
            .iter()
            .map(|&i| concat[i].to_vec())
            .collect();
        ctx.emit(RowBatch::from_columns(columns)?)?;
        Ok(())
    }
}
