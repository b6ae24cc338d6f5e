//! Streaming folds.
//!
//! A reduce runs as: initial state, per-row fold within a segment, then a
//! serial combine of the per-segment states on the driver. When a reduce
//! node sits mid-pipeline it drains its input in one step and emits the
//! single-row result itself.

use std::sync::Arc;

use sfq_common::{Cell, CellType, Result, SfqError};

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::{check_arity, conform_cell, QueryOperator};
use crate::planning::infer::infer_dtype;
use crate::planning::node::{NodeRef, OpaqueParam, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

/// A streaming fold: initial state, per-row fold, cross-segment combine.
///
/// State is itself a cell, which keeps per-segment partials trivially
/// transferable between workers and the driver.
pub trait ReduceFunction: Send + Sync {
    fn name(&self) -> &'static str;

    fn initial(&self) -> Cell;

    fn fold(&self, state: &mut Cell, row: &[Cell]) -> Result<()>;

    fn combine(&self, state: &mut Cell, other: &Cell) -> Result<()>;

    fn output_type(&self, input: &[CellType]) -> CellType;
}

/// Fold `input` to a single row with `reducer`.
pub fn make_reduce_node(input: NodeRef, reducer: Arc<dyn ReduceFunction>) -> Result<NodeRef> {
    let inputs = vec![input];
    check_arity(PlannerNodeType::Reduce, &inputs)?;
    let out = reducer.output_type(&infer_dtype(&inputs[0])?);
    Ok(PlannerNode::new(PlannerNodeType::Reduce)
        .with_opaque("reducer", OpaqueParam::Reducer(reducer))
        .with_opaque("output_types", OpaqueParam::Types(vec![out]))
        .with_inputs(inputs)
        .into_ref())
}

pub(crate) fn reducer_param(n: &PlannerNode) -> Result<Arc<dyn ReduceFunction>> {
    match n.opaque("reducer")? {
        OpaqueParam::Reducer(r) => Ok(r.clone()),
        _ => Err(SfqError::Internal("reduce node carries no reducer".into())),
    }
}

pub(crate) fn reduce_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(ReduceOp {
        reducer: reducer_param(n)?,
        output_type: n.types("output_types")?[0],
        emitted: false,
    }))
}

struct ReduceOp {
    reducer: Arc<dyn ReduceFunction>,
    output_type: CellType,
    emitted: bool,
}

impl QueryOperator for ReduceOp {
    fn name(&self) -> &'static str {
        "reduce"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Reduce)
    }

    fn reset(&mut self) {
        self.emitted = false;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if self.emitted {
            return Ok(());
        }
        let mut state = self.reducer.initial();
        let mut scratch = Vec::new();
        while let Some(batch) = ctx.get_next(0)? {
            fold_batch(self.reducer.as_ref(), &mut state, &batch, &mut scratch)?;
        }
        self.emitted = true;
        let cell = conform_cell(state, self.output_type)?;
        ctx.emit(RowBatch::from_columns(vec![vec![cell]])?)?;
        Ok(())
    }
}

/// Fold every row of a block into `state`.
pub(crate) fn fold_batch(
    reducer: &dyn ReduceFunction,
    state: &mut Cell,
    batch: &RowBatch,
    scratch: &mut Vec<Cell>,
) -> Result<()> {
    for row in batch.rows() {
        scratch.clear();
        for c in 0..row.len() {
            scratch.push(row.cell(c).clone());
        }
        reducer.fold(state, scratch)?;
    }
    Ok(())
}

/// Sum of the first column; undefined cells are skipped. Integer in,
/// integer out; float in, float out.
pub struct SumReducer;

impl ReduceFunction for SumReducer {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn initial(&self) -> Cell {
        Cell::Integer(0)
    }

    fn fold(&self, state: &mut Cell, row: &[Cell]) -> Result<()> {
        add_into(state, &row[0])
    }

    fn combine(&self, state: &mut Cell, other: &Cell) -> Result<()> {
        add_into(state, other)
    }

    fn output_type(&self, input: &[CellType]) -> CellType {
        match input.first() {
            Some(CellType::Float) => CellType::Float,
            _ => CellType::Integer,
        }
    }
}

fn add_into(state: &mut Cell, value: &Cell) -> Result<()> {
    let next = match (&*state, value) {
        (s, Cell::Undefined) => s.clone(),
        (Cell::Integer(a), Cell::Integer(b)) => Cell::Integer(a + b),
        (Cell::Integer(a), Cell::Float(b)) => Cell::Float(*a as f64 + b),
        (Cell::Float(a), Cell::Integer(b)) => Cell::Float(a + *b as f64),
        (Cell::Float(a), Cell::Float(b)) => Cell::Float(a + b),
        (s, v) => {
            return Err(SfqError::TypeMismatch(format!(
                "cannot sum a {} into a {}",
                v.type_of(),
                s.type_of()
            )))
        }
    };
    *state = next;
    Ok(())
}

/// Number of rows whose first column is defined.
pub struct CountReducer;

impl ReduceFunction for CountReducer {
    fn name(&self) -> &'static str {
        "count"
    }

    fn initial(&self) -> Cell {
        Cell::Integer(0)
    }

    fn fold(&self, state: &mut Cell, row: &[Cell]) -> Result<()> {
        if !row[0].is_undefined() {
            if let Cell::Integer(n) = state {
                *n += 1;
            }
        }
        Ok(())
    }

    fn combine(&self, state: &mut Cell, other: &Cell) -> Result<()> {
        if let (Cell::Integer(a), Cell::Integer(b)) = (&mut *state, other) {
            *a += b;
        }
        Ok(())
    }

    fn output_type(&self, _input: &[CellType]) -> CellType {
        CellType::Integer
    }
}

/// Smallest defined value of the first column.
pub struct MinReducer;

impl ReduceFunction for MinReducer {
    fn name(&self) -> &'static str {
        "min"
    }

    fn initial(&self) -> Cell {
        Cell::Undefined
    }

    fn fold(&self, state: &mut Cell, row: &[Cell]) -> Result<()> {
        self.combine(state, &row[0])
    }

    fn combine(&self, state: &mut Cell, other: &Cell) -> Result<()> {
        if other.is_undefined() {
            return Ok(());
        }
        if state.is_undefined() || other.total_cmp(state) == std::cmp::Ordering::Less {
            *state = other.clone();
        }
        Ok(())
    }

    fn output_type(&self, input: &[CellType]) -> CellType {
        input.first().copied().unwrap_or(CellType::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_folds_and_combines() {
        let r = SumReducer;
        let mut a = r.initial();
        for v in 1..=3 {
            r.fold(&mut a, &[Cell::Integer(v)]).unwrap();
        }
        let mut b = r.initial();
        for v in 4..=5 {
            r.fold(&mut b, &[Cell::Integer(v)]).unwrap();
        }
        r.combine(&mut a, &b).unwrap();
        assert_eq!(a, Cell::Integer(15));
    }

    #[test]
    fn sum_skips_undefined_and_promotes_floats() {
        let r = SumReducer;
        let mut s = r.initial();
        r.fold(&mut s, &[Cell::Undefined]).unwrap();
        r.fold(&mut s, &[Cell::Integer(1)]).unwrap();
        r.fold(&mut s, &[Cell::Float(0.5)]).unwrap();
        assert_eq!(s, Cell::Float(1.5));
    }

    #[test]
    fn min_ignores_undefined() {
        let r = MinReducer;
        let mut s = r.initial();
        r.fold(&mut s, &[Cell::Undefined]).unwrap();
        r.fold(&mut s, &[Cell::Integer(4)]).unwrap();
        r.fold(&mut s, &[Cell::Integer(-2)]).unwrap();
        assert_eq!(s, Cell::Integer(-2));
    }
}
