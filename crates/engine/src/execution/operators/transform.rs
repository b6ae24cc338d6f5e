//! Row-wise transforms: one input row in, one output row out.

use std::sync::Arc;

use sfq_common::{Cell, CellType, Result, SfqError};

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, conform_cell, map_fn_param, QueryOperator};
use crate::planning::infer::infer_length;
use crate::planning::node::{
    BinaryMapFn, MultiMapFn, NodeRef, OpaqueParam, PlannerNode, RowMapFn,
};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

// ---- planner-node constructors ----

/// Apply `f` to every row of `input`, producing one `output_type` column.
pub fn make_transform_node(
    input: NodeRef,
    f: Arc<RowMapFn>,
    output_type: CellType,
) -> Result<NodeRef> {
    let inputs = vec![input];
    check_arity(PlannerNodeType::Transform, &inputs)?;
    Ok(PlannerNode::new(PlannerNodeType::Transform)
        .with_opaque("function", OpaqueParam::MapFn(f))
        .with_opaque("output_types", OpaqueParam::Types(vec![output_type]))
        .with_inputs(inputs)
        .into_ref())
}

/// Apply `f` to row i of both inputs, producing one `output_type` column.
pub fn make_binary_transform_node(
    left: NodeRef,
    right: NodeRef,
    f: Arc<BinaryMapFn>,
    output_type: CellType,
) -> Result<NodeRef> {
    let inputs = vec![left, right];
    check_arity(PlannerNodeType::BinaryTransform, &inputs)?;
    if let (Some(a), Some(b)) = (infer_length(&inputs[0])?, infer_length(&inputs[1])?) {
        if a != b {
            return Err(SfqError::InvalidPlan(format!(
                "binary transform inputs have {a} and {b} rows"
            )));
        }
    }
    Ok(PlannerNode::new(PlannerNodeType::BinaryTransform)
        .with_opaque("function", OpaqueParam::BinaryMapFn(f))
        .with_opaque("output_types", OpaqueParam::Types(vec![output_type]))
        .with_inputs(inputs)
        .into_ref())
}

/// Apply `f` to every row, producing one row of `output_types` columns.
pub fn make_generalized_transform_node(
    input: NodeRef,
    f: Arc<MultiMapFn>,
    output_types: Vec<CellType>,
) -> Result<NodeRef> {
    if output_types.is_empty() {
        return Err(SfqError::InvalidPlan(
            "generalized transform needs at least one output column".into(),
        ));
    }
    let inputs = vec![input];
    check_arity(PlannerNodeType::GeneralizedTransform, &inputs)?;
    Ok(PlannerNode::new(PlannerNodeType::GeneralizedTransform)
        .with_opaque("function", OpaqueParam::MultiMapFn(f))
        .with_opaque("output_types", OpaqueParam::Types(output_types))
        .with_inputs(inputs)
        .into_ref())
}

// ---- operators ----

pub(crate) fn transform_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(TransformOp {
        f: map_fn_param(n, "function")?,
        output_type: n.types("output_types")?[0],
    }))
}

pub(crate) fn binary_transform_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    let f = match n.opaque("function")? {
        OpaqueParam::BinaryMapFn(f) => f.clone(),
        _ => {
            return Err(SfqError::Internal(
                "binary transform node carries no pair function".into(),
            ))
        }
    };
    Ok(Box::new(BinaryTransformOp {
        f,
        output_type: n.types("output_types")?[0],
    }))
}

pub(crate) fn generalized_transform_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    let f = match n.opaque("function")? {
        OpaqueParam::MultiMapFn(f) => f.clone(),
        _ => {
            return Err(SfqError::Internal(
                "generalized transform node carries no row function".into(),
            ))
        }
    };
    Ok(Box::new(GeneralizedTransformOp {
        f,
        output_types: n.types("output_types")?.to_vec(),
    }))
}

struct TransformOp {
    f: Arc<RowMapFn>,
    output_type: CellType,
}

impl QueryOperator for TransformOp {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Transform)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if ctx.should_skip() {
            let Some(batch) = ctx.skip_next(0)? else {
                return Ok(());
            };
            ctx.emit(RowBatch::placeholder(1, batch.num_rows()))?;
            return Ok(());
        }
        let Some(batch) = ctx.get_next(0)? else {
            return Ok(());
        };
        let mut col = Vec::with_capacity(batch.num_rows());
        let mut scratch = Vec::with_capacity(batch.num_columns());
        for row in batch.rows() {
            scratch.clear();
            for c in 0..row.len() {
                scratch.push(row.cell(c).clone());
            }
            col.push(conform_cell((self.f)(&scratch)?, self.output_type)?);
        }
        ctx.emit(RowBatch::from_columns(vec![col])?)?;
        Ok(())
    }
}

struct BinaryTransformOp {
    f: Arc<BinaryMapFn>,
    output_type: CellType,
}

impl QueryOperator for BinaryTransformOp {
    fn name(&self) -> &'static str {
        "binary_transform"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::BinaryTransform)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let (left, right) = if ctx.should_skip() {
            (ctx.skip_next(0)?, ctx.skip_next(1)?)
        } else {
            (ctx.get_next(0)?, ctx.get_next(1)?)
        };
        let (left, right) = match (left, right) {
            (None, None) => return Ok(()),
            (Some(l), Some(r)) => (l, r),
            _ => {
                return Err(SfqError::Internal(
                    "binary transform inputs ended at different lengths".into(),
                ))
            }
        };
        if left.num_rows() != right.num_rows() {
            return Err(SfqError::Internal(format!(
                "binary transform pulled misaligned blocks ({} vs {} rows)",
                left.num_rows(),
                right.num_rows()
            )));
        }
        if ctx.should_skip() {
            ctx.emit(RowBatch::placeholder(1, left.num_rows()))?;
            return Ok(());
        }
        let mut col = Vec::with_capacity(left.num_rows());
        let mut ls = Vec::with_capacity(left.num_columns());
        let mut rs = Vec::with_capacity(right.num_columns());
        for i in 0..left.num_rows() {
            ls.clear();
            rs.clear();
            for c in 0..left.num_columns() {
                ls.push(left.column(c)[i].clone());
            }
            for c in 0..right.num_columns() {
                rs.push(right.column(c)[i].clone());
            }
            col.push(conform_cell((self.f)(&ls, &rs)?, self.output_type)?);
        }
        ctx.emit(RowBatch::from_columns(vec![col])?)?;
        Ok(())
    }
}

struct GeneralizedTransformOp {
    f: Arc<MultiMapFn>,
    output_types: Vec<CellType>,
}

impl QueryOperator for GeneralizedTransformOp {
    fn name(&self) -> &'static str {
        "generalized_transform"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::GeneralizedTransform)
    }

    fn reset(&mut self) {}

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let ncols = self.output_types.len();
        if ctx.should_skip() {
            let Some(batch) = ctx.skip_next(0)? else {
                return Ok(());
            };
            ctx.emit(RowBatch::placeholder(ncols, batch.num_rows()))?;
            return Ok(());
        }
        let Some(batch) = ctx.get_next(0)? else {
            return Ok(());
        };
        let mut columns: Vec<Vec<Cell>> = (0..ncols)
            .map(|_| Vec::with_capacity(batch.num_rows()))
            .collect();
        let mut scratch = Vec::with_capacity(batch.num_columns());
        for row in batch.rows() {
            scratch.clear();
            for c in 0..row.len() {
                scratch.push(row.cell(c).clone());
            }
            let out = (self.f)(&scratch)?;
            if out.len() != ncols {
                return Err(SfqError::TypeMismatch(format!(
                    "generalized transform produced {} cells for {ncols} columns",
                    out.len()
                )));
            }
            for (c, cell) in out.into_iter().enumerate() {
                columns[c].push(conform_cell(cell, self.output_types[c])?);
            }
        }
        ctx.emit(RowBatch::from_columns(columns)?)?;
        Ok(())
    }
}
