//! Source operators: constants, ranges, and stored columns/frames.

use sfq_common::{Cell, Result, SfqError};
use sfq_storage::{RangeReader, SArray, SFrame};

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::QueryOperator;
use crate::planning::node::{NodeRef, OpaqueParam, PlannerNode};
use crate::planning::registry::{attributes_of, PlannerNodeType, QueryOperatorAttributes};

// ---- planner-node constructors ----

/// A single column of `size` copies of `value`.
pub fn make_constant_node(value: Cell, size: u64) -> NodeRef {
    PlannerNode::new(PlannerNodeType::Constant)
        .with_scalar("value", value)
        .with_scalar("size", size as i64)
        .into_ref()
}

/// The integers `[begin, end)` as a single column.
pub fn make_range_node(begin: u64, end: u64) -> Result<NodeRef> {
    if begin > end {
        return Err(SfqError::InvalidPlan(format!(
            "range [{begin}, {end}) is inverted"
        )));
    }
    Ok(PlannerNode::new(PlannerNodeType::Range)
        .with_scalar("begin_index", begin as i64)
        .with_scalar("end_index", end as i64)
        .into_ref())
}

/// A stored column over its full row range.
pub fn make_sarray_source_node(column: SArray) -> NodeRef {
    let end = column.len();
    make_sarray_source_range_node(column, 0, end).expect("full range is valid")
}

/// A stored column over rows `[begin, end)`.
pub fn make_sarray_source_range_node(column: SArray, begin: u64, end: u64) -> Result<NodeRef> {
    if begin > end || end > column.len() {
        return Err(SfqError::InvalidPlan(format!(
            "row range [{begin}, {end}) out of bounds for column of {} rows",
            column.len()
        )));
    }
    Ok(PlannerNode::new(PlannerNodeType::SArraySource)
        .with_scalar("begin_index", begin as i64)
        .with_scalar("end_index", end as i64)
        .with_opaque("column", OpaqueParam::Column(column))
        .into_ref())
}

/// A stored frame over its full row range.
pub fn make_sframe_source_node(frame: SFrame) -> NodeRef {
    let end = frame.num_rows();
    make_sframe_source_range_node(frame, 0, end).expect("full range is valid")
}

/// A stored frame over rows `[begin, end)`.
pub fn make_sframe_source_range_node(frame: SFrame, begin: u64, end: u64) -> Result<NodeRef> {
    if frame.num_columns() == 0 {
        return Err(SfqError::InvalidPlan(
            "cannot build a source over a zero-column frame".into(),
        ));
    }
    if begin > end || end > frame.num_rows() {
        return Err(SfqError::InvalidPlan(format!(
            "row range [{begin}, {end}) out of bounds for frame of {} rows",
            frame.num_rows()
        )));
    }
    Ok(PlannerNode::new(PlannerNodeType::SFrameSource)
        .with_scalar("begin_index", begin as i64)
        .with_scalar("end_index", end as i64)
        .with_opaque("frame", OpaqueParam::Frame(frame))
        .into_ref())
}

// ---- operators ----

pub(crate) fn constant_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(ConstantOp {
        value: n.scalar("value")?.clone(),
        size: n.scalar_u64("size")?,
        produced: 0,
    }))
}

pub(crate) fn range_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    Ok(Box::new(RangeOp {
        begin: n.scalar_u64("begin_index")?,
        end: n.scalar_u64("end_index")?,
        next: n.scalar_u64("begin_index")?,
    }))
}

pub(crate) fn sarray_source_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    let begin = n.scalar_u64("begin_index")?;
    Ok(Box::new(SArraySourceOp {
        column: n.column("column")?.clone(),
        begin,
        end: n.scalar_u64("end_index")?,
        cursor: begin,
        reader: None,
    }))
}

pub(crate) fn sframe_source_operator(n: &PlannerNode) -> Result<Box<dyn QueryOperator>> {
    let begin = n.scalar_u64("begin_index")?;
    Ok(Box::new(SFrameSourceOp {
        frame: n.frame("frame")?.clone(),
        begin,
        end: n.scalar_u64("end_index")?,
        cursor: begin,
        readers: None,
    }))
}

struct ConstantOp {
    value: Cell,
    size: u64,
    produced: u64,
}

impl QueryOperator for ConstantOp {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Constant)
    }

    fn reset(&mut self) {
        self.produced = 0;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let remaining = self.size - self.produced;
        if remaining == 0 {
            return Ok(());
        }
        let n = remaining.min(ctx.batch_size() as u64) as usize;
        self.produced += n as u64;
        let batch = if ctx.should_skip() {
            RowBatch::placeholder(1, n)
        } else {
            RowBatch::from_columns(vec![vec![self.value.clone(); n]])?
        };
        ctx.emit(batch)?;
        Ok(())
    }
}

struct RangeOp {
    begin: u64,
    end: u64,
    next: u64,
}

impl QueryOperator for RangeOp {
    fn name(&self) -> &'static str {
        "range"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::Range)
    }

    fn reset(&mut self) {
        self.next = self.begin;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if self.next >= self.end {
            return Ok(());
        }
        let n = (self.end - self.next).min(ctx.batch_size() as u64);
        let batch = if ctx.should_skip() {
            RowBatch::placeholder(1, n as usize)
        } else {
            let col = (self.next..self.next + n)
                .map(|v| Cell::Integer(v as i64))
                .collect();
            RowBatch::from_columns(vec![col])?
        };
        self.next += n;
        ctx.emit(batch)?;
        Ok(())
    }
}

struct SArraySourceOp {
    column: SArray,
    begin: u64,
    end: u64,
    cursor: u64,
    reader: Option<RangeReader>,
}

impl QueryOperator for SArraySourceOp {
    fn name(&self) -> &'static str {
        "sarray_source"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::SArraySource)
    }

    fn reset(&mut self) {
        self.cursor = self.begin;
        self.reader = None;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if self.cursor >= self.end {
            return Ok(());
        }
        let n = ((self.end - self.cursor).min(ctx.batch_size() as u64)) as usize;
        if ctx.should_skip() {
            // don't decode; the reader restarts at the cursor on the next
            // real read
            self.cursor += n as u64;
            self.reader = None;
            ctx.emit(RowBatch::placeholder(1, n))?;
            return Ok(());
        }
        if self.reader.is_none() {
            self.reader = Some(self.column.range_iter(self.cursor, self.end)?);
        }
        let reader = self.reader.as_mut().expect("reader present");
        let mut col = Vec::with_capacity(n);
        for _ in 0..n {
            match reader.next() {
                Some(cell) => col.push(cell?),
                None => {
                    return Err(SfqError::Storage(
                        "column ended before its indexed row count".into(),
                    ))
                }
            }
        }
        self.cursor += n as u64;
        ctx.emit(RowBatch::from_columns(vec![col])?)?;
        Ok(())
    }
}

struct SFrameSourceOp {
    frame: SFrame,
    begin: u64,
    end: u64,
    cursor: u64,
    readers: Option<Vec<RangeReader>>,
}

impl QueryOperator for SFrameSourceOp {
    fn name(&self) -> &'static str {
        "sframe_source"
    }

    fn attributes(&self) -> QueryOperatorAttributes {
        attributes_of(PlannerNodeType::SFrameSource)
    }

    fn reset(&mut self) {
        self.cursor = self.begin;
        self.readers = None;
    }

    fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if self.cursor >= self.end {
            return Ok(());
        }
        let ncols = self.frame.num_columns();
        let n = ((self.end - self.cursor).min(ctx.batch_size() as u64)) as usize;
        if ctx.should_skip() {
            self.cursor += n as u64;
            self.readers = None;
            ctx.emit(RowBatch::placeholder(ncols, n))?;
            return Ok(());
        }
        if self.readers.is_none() {
            let mut readers = Vec::with_capacity(ncols);
            for c in 0..ncols {
                readers.push(self.frame.column(c).range_iter(self.cursor, self.end)?);
            }
            self.readers = Some(readers);
        }
        let readers = self.readers.as_mut().expect("readers present");
        let mut columns = Vec::with_capacity(ncols);
        for reader in readers.iter_mut() {
            let mut col = Vec::with_capacity(n);
            for _ in 0..n {
                match reader.next() {
                    Some(cell) => col.push(cell?),
                    None => {
                        return Err(SfqError::Storage(
                            "frame column ended before its indexed row count".into(),
                        ))
                    }
                }
            }
            columns.push(col);
        }
        self.cursor += n as u64;
        ctx.emit(RowBatch::from_columns(columns)?)?;
        Ok(())
    }
}
