//! Transform evaluated by the out-of-process lambda worker.

use sfq_common::{CellType, Result, SfqError};

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, conform_cell, QueryOperator};
use crate::planning::node::{LambdaSpec, NodeRef, OpaqueParam, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

/// Liveness probes attempted before declaring the worker dead.
const PING_ATTEMPTS: usize = 3;

/// Apply a worker-evaluated lambda to every row of `input`.
pub fn make_lambda_transform_node(
    input: NodeRef,
    spec: LambdaSpec,
    output_type: CellType,
) -> Result<NodeRef> {
    if spec.code.is_empty() {
        return Err(SfqError::InvalidPlan("empty lambda code blob".into()));
    }
    let inputs = vec![input];
    check_arity(PlannerNodeType::LambdaTransform, &inputs)?;
    Ok(PlannerNode::new(PlannerNodeType::LambdaTransform)
        .with_opaque("lambda", OpaqueParam::Lambda(spec))
        .with_opaque("output_types", OpaqueParam::Types(vec![output_type]))
        .with_inputs(inputs)
        .into_ref())
}

pub(crate) fn lambda_transform_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    let spec = match n.opaque("lambda")? {
        OpaqueParam::Lambda(l) => l.clone(),
        _ => {
            return Err(SfqError::Internal(
                "lambda transform node carries no lambda payload".into(),
            ))
        }
    };
    Ok(Box::new(LambdaTransformOp {
        spec,
        output_type: n.types("output_types")?[0],
        lambda_id: None,
    }))
}

struct LambdaTransformOp {
    spec: LambdaSpec,
    output_type: CellType,
    lambda_id: Option<u64>,
}

impl LambdaTransformOp {
    /// The lambda-id handshake precedes the first block.
    fn ensure_lambda(&mut self) -> Result<u64> {
        if let Some(id) = self.lambda_id {
            return Ok(id);
        }
        let mut last = None;
        for _ in 0..PING_ATTEMPTS {
            match self.spec.channel.ping() {
                Ok(()) => {
                    let id = self.spec.channel.make_lambda(&self.spec.code)?;
                    self.lambda_id = Some(id);
                    return Ok(id);
                }
                Err(e) => last = Some(e),
            }
        }
        Err(SfqError::Unreachable(format!(
            "lambda worker failed {PING_ATTEMPTS} liveness probes: {}",
            last.expect("probe failed at least once")
        )))
    }

    fn release(&mut self) {
        if let Some(id) = self.lambda_id.take() {
            let _ = self.spec.channel.release_lambda(id);
        }
    }
}

impl QueryOperator for LambdaTransformOp {
    fn name(&self) -> &'static str {
        "lambda_transform"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::LambdaTransform)
    }

    fn reset(&mut self) {
        self.release();
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if ctx.should_skip() {
            let Some(batch) = ctx.skip_next(0)? else {
                return Ok(());
            };
            ctx.emit(RowBatch::placeholder(1, batch.num_rows()))?;
            return Ok(());
        }
        let id = self.ensure_lambda()?;
        let Some(batch) = ctx.get_next(0)? else {
            self.release();
            return Ok(());
        };
        let rows: Vec<Vec<_>> = batch.rows().map(|r| r.to_vec()).collect();
        let cells = self.spec.channel.bulk_eval(
            id,
            &rows,
            self.spec.skip_undefined,
            self.spec.seed,
        )?;
        if cells.len() != batch.num_rows() {
            return Err(SfqError::Unreachable(format!(
                "lambda worker returned {} cells for {} rows",
                cells.len(),
                batch.num_rows()
            )));
        }
        let col = cells
            .into_iter()
            .map(|c| conform_cell(c, self.output_type))
            .collect::<Result<Vec<_>>>()?;
        ctx.emit(RowBatch::from_columns(vec![col])?)?;
        Ok(())
    }
}

impl Drop for LambdaTransformOp {
    fn drop(&mut self) {
        self.release();
    }
}
