//! Vertical concat: drain the first input to its end, then the second.

use sfq_common::{Result, SfqError};

use crate::execution::batch::RowBuffer;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, QueryOperator};
use crate::planning::infer::{infer_dtype, infer_num_columns};
use crate::planning::node::{read_node, NodeRef, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

/// Rows of `top` followed by rows of `bottom`; dtypes must match.
pub fn make_append_node(top: NodeRef, bottom: NodeRef) -> Result<NodeRef> {
    let inputs = vec![top, bottom];
    check_arity(PlannerNodeType::Append, &inputs)?;
    let a = infer_dtype(&inputs[0])?;
    let b = infer_dtype(&inputs[1])?;
    if a != b {
        return Err(SfqError::InvalidPlan(format!(
            "cannot append {b:?} columns onto {a:?}"
        )));
    }
    Ok(PlannerNode::new(PlannerNodeType::Append)
        .with_inputs(inputs)
        .into_ref())
}

pub(crate) fn append_operator(node: &NodeRef) -> Result<Box<dyn QueryOperator>> {
    let first = read_node(node).inputs[0].clone();
    let ncols = infer_num_columns(&first)?;
    Ok(Box::new(AppendOp {
        ncols,
        phase: 0,
        buffer: None,
        exhausted: false,
    }))
}

/// Input terminal blocks may be short, so rows re-buffer into full-size
/// output blocks; only the overall terminal block is allowed to be short.
struct AppendOp {
    ncols: usize,
    phase: usize,
    buffer: Option<RowBuffer>,
    exhausted: bool,
}

impl QueryOperator for AppendOp {
    fn name(&self) -> &'static str {
        "append"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Append)
    }

    fn reset(&mut self) {
        self.phase = 0;
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
            if self.phase > 1 {
                self.exhausted = true;
                if let Some(rest) = buffer.take_rest() {
                    ctx.emit(rest)?;
                }
                return Ok(());
            }
            let pulled = if ctx.should_skip() {
                ctx.skip_next(self.phase)?
            } else {
                ctx.get_next(self.phase)?
            };
            match pulled {
                Some(block) => {
                    for row in block.rows() {
                        buffer.push_row(row);
                    }
                    if let Some(full) = buffer.take_full_block() {
                        ctx.emit(full)?;
                        return Ok(());
                    }
                }
                None => self.phase += 1,
            }
        }
    }
}
