//! Logical filter: data rows selected by a 0/1 mask read in lock step.

use sfq_common::{CellType, Result, SfqError};

use crate::execution::batch::RowBuffer;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, QueryOperator};
use crate::planning::infer::{infer_dtype, infer_length, infer_num_columns};
use crate::planning::node::{read_node, NodeRef, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

/// Rows of `data` where the matching `mask` row is truthy.
pub fn make_logical_filter_node(data: NodeRef, mask: NodeRef) -> Result<NodeRef> {
    let inputs = vec![data, mask];
    check_arity(PlannerNodeType::LogicalFilter, &inputs)?;
    if infer_num_columns(&inputs[1])? != 1 {
        return Err(SfqError::InvalidPlan(
            "filter mask must be a single column".into(),
        ));
    }
    let mask_type = infer_dtype(&inputs[1])?[0];
    if !matches!(
        mask_type,
        CellType::Integer | CellType::Float | CellType::Undefined
    ) {
        return Err(SfqError::InvalidPlan(format!(
            "filter mask must be numeric, got {mask_type}"
        )));
    }
    if let (Some(a), Some(b)) = (infer_length(&inputs[0])?, infer_length(&inputs[1])?) {
        if a != b {
            return Err(SfqError::InvalidPlan(format!(
                "filter data has {a} rows but mask has {b}"
            )));
        }
    }
    Ok(PlannerNode::new(PlannerNodeType::LogicalFilter)
        .with_inputs(inputs)
        .into_ref())
}

pub(crate) fn logical_filter_operator(node: &NodeRef) -> Result<Box<dyn QueryOperator>> {
    let data = read_node(node).inputs[0].clone();
    let ncols = infer_num_columns(&data)?;
    Ok(Box::new(LogicalFilterOp {
        ncols,
        buffer: None,
        exhausted: false,
    }))
}

/// Selected rows accumulate until a full output block can be cut; the
/// residual flushes when both inputs end. The mask is always read for real
/// (a skipped mask would make the output row count wrong); only the data
/// side honors skip requests.
struct LogicalFilterOp {
    ncols: usize,
    buffer: Option<RowBuffer>,
    exhausted: bool,
}

impl QueryOperator for LogicalFilterOp {
    fn name(&self) -> &'static str {
        "logical_filter"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::LogicalFilter)
    }

    fn reset(&mut self) {
        self.buffer = None;
        self.exhausted = false;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let target = ctx.batch_size();
        let buffer = self
            .buffer
            .get_or_insert_with(|| RowBuffer::new(self.ncols, target));
        if let Some(block) = buffer.take_full_block() {
            ctx.emit(block)?;
            return Ok(());
        }
        if self.exhausted {
            if let Some(rest) = buffer.take_rest() {
                ctx.emit(rest)?;
            }
            return Ok(());
        }
        loop {
            let data = if ctx.should_skip() {
                ctx.skip_next(0)?
            } else {
                ctx.get_next(0)?
            };
            let mask = ctx.get_next(1)?;
            let (data, mask) = match (data, mask) {
                (None, None) => {
                    self.exhausted = true;
                    if let Some(rest) = buffer.take_rest() {
                        ctx.emit(rest)?;
                    }
                    return Ok(());
                }
                (Some(d), Some(m)) => (d, m),
                _ => {
                    return Err(SfqError::Internal(
                        "filter data and mask ended at different lengths".into(),
                    ))
                }
            };
            if data.num_rows() != mask.num_rows() {
                return Err(SfqError::Internal(format!(
                    "filter pulled misaligned blocks ({} data rows, {} mask rows)",
                    data.num_rows(),
                    mask.num_rows()
                )));
            }
            let mask_col = mask.column(0);
            for (i, flag) in mask_col.iter().enumerate() {
                if flag.is_truthy() {
                    buffer.push_row(data.row(i));
                }
            }
            if let Some(full) = buffer.take_full_block() {
                ctx.emit(full)?;
                return Ok(());
            }
        }
    }
}
