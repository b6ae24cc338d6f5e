//! Operator implementations, one module per family, plus the factory that
//! turns a planner node into a runnable operator.
//!
//! Each module also hosts the planner-node constructors for its kinds:
//! the constructor owns the validation (arity, dtypes, parameter ranges)
//! and fails with `InvalidPlan` before anything executes.

pub mod append;
pub mod filter;
pub mod lambda_transform;
pub mod project;
pub mod reduce;
pub mod source;
pub mod transform;

use sfq_common::{Cell, CellType, Result, SfqError};

use crate::execution::context::QueryContext;
use crate::planning::node::{read_node, NodeRef, OpaqueParam};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

/// A runnable operator.
///
/// `execute` is one scheduling step: pull whatever inputs the step needs
/// through `ctx`, then either emit exactly one block or return without
/// emitting, which ends the stream. State that must survive between blocks
/// (buffers, cursors, drain phase) lives on the operator and is wiped by
/// `reset`.
pub trait QueryOperator {
    fn name(&self) -> &'static str;

    fn attributes(&self) -> QueryOperatorAttributes;

    /// Clear internal state back to start-of-stream.
    fn reset(&mut self);

    /// Produce at most one block.
    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()>;
}

/// Instantiate the operator for a planner node.
pub fn planner_node_to_operator(node: &NodeRef) -> Result<Box<dyn QueryOperator>> {
    let n = read_node(node);
    match n.kind {
        PlannerNodeType::Constant => source::constant_operator(&n),
        PlannerNodeType::Range => source::range_operator(&n),
        PlannerNodeType::SArraySource => source::sarray_source_operator(&n),
        PlannerNodeType::SFrameSource => source::sframe_source_operator(&n),
        PlannerNodeType::Transform => transform::transform_operator(&n),
        PlannerNodeType::BinaryTransform => transform::binary_transform_operator(&n),
        PlannerNodeType::GeneralizedTransform => transform::generalized_transform_operator(&n),
        PlannerNodeType::LambdaTransform => lambda_transform::lambda_transform_operator(&n),
        PlannerNodeType::Project => project::project_operator(&n),
        PlannerNodeType::Union => project::union_operator(&n),
        PlannerNodeType::GeneralizedUnionProject => {
            project::generalized_union_project_operator(&n)
        }
        PlannerNodeType::Append => {
            drop(n);
            append::append_operator(node)
        }
        PlannerNodeType::LogicalFilter => {
            drop(n);
            filter::logical_filter_operator(node)
        }
        PlannerNodeType::Reduce => reduce::reduce_operator(&n),
        PlannerNodeType::Identity => Err(SfqError::Internal(
            "identity nodes must be optimized away before execution".into(),
        )),
    }
}

/// Logical no-op wrapper. Exists only while plans are being composed and
/// rewritten; the optimizer erases every identity before execution.
pub fn make_identity_node(input: NodeRef) -> NodeRef {
    use crate::planning::node::PlannerNode;
    PlannerNode::new(PlannerNodeType::Identity)
        .with_inputs(vec![input])
        .into_ref()
}

/// Factory-side arity check shared by all node constructors.
pub(crate) fn check_arity(kind: PlannerNodeType, inputs: &[NodeRef]) -> Result<()> {
    let arity = attributes_of(kind).num_inputs;
    if !arity.accepts(inputs.len()) {
        return Err(SfqError::InvalidPlan(format!(
            "{} takes {:?} inputs, got {}",
            kind.name(),
            arity,
            inputs.len()
        )));
    }
    Ok(())
}

/// Check a produced cell against the declared output type, widening
/// integers into float columns; anything else mistyped is an error.
pub(crate) fn conform_cell(cell: Cell, expected: CellType) -> Result<Cell> {
    match (cell.type_of(), expected) {
        (t, e) if t == e => Ok(cell),
        (CellType::Undefined, _) => Ok(cell),
        (CellType::Integer, CellType::Float) => {
            Ok(Cell::Float(cell.as_integer().expect("integer cell") as f64))
        }
        (t, e) => Err(SfqError::TypeMismatch(format!(
            "operator produced a {t} cell for a {e} column"
        ))),
    }
}

pub(crate) fn map_fn_param(
    n: &crate::planning::node::PlannerNode,
    key: &str,
) -> Result<std::sync::Arc<crate::planning::node::RowMapFn>> {
    match n.opaque(key)? {
        OpaqueParam::MapFn(f) => Ok(f.clone()),
        _ => Err(SfqError::Internal(format!(
            "{} node param {key} is not a row function",
            n.kind.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conform_widens_and_rejects() {
        assert_eq!(
            conform_cell(Cell::Integer(2), CellType::Float).unwrap(),
            Cell::Float(2.0)
        );
        assert_eq!(
            conform_cell(Cell::Undefined, CellType::String).unwrap(),
            Cell::Undefined
        );
        assert!(conform_cell(Cell::String("x".into()), CellType::Integer).is_err());
    }
}
