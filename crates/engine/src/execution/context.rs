//! The facade an operator sees while it runs.
//!
//! Exactly three channels exist between an operator and the world:
//! pulling a block from an input, asking an input to skip a block, and
//! emitting a block downstream. Everything else (buffering, consumer
//! bookkeeping, error latching) belongs to the execution node.

use std::rc::Rc;

use sfq_common::{CancelFlag, Result, SfqError};

use crate::execution::batch::RowBatch;
use crate::execution::exec_node::InputEdge;

/// What `emit` tells the operator about continuing.
///
/// `Stop` is advisory: downstream has no further use for output (the sink
/// is satisfied or the query is being cancelled). Operators should wind
/// down promptly but are not required to notice mid-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitState {
    Continue,
    Stop,
}

/// Per-step operator context handed to [`QueryOperator::execute`].
///
/// [`QueryOperator::execute`]: crate::execution::operators::QueryOperator::execute
pub struct QueryContext<'a> {
    inputs: &'a [InputEdge],
    batch_size: usize,
    skip_output: bool,
    cancel: &'a CancelFlag,
    emitted: Option<RowBatch>,
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(
        inputs: &'a [InputEdge],
        batch_size: usize,
        skip_output: bool,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            inputs,
            batch_size,
            skip_output,
            cancel,
            emitted: None,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Target rows per emitted block.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Every consumer asked to skip the block this step will produce; the
    /// operator may emit a placeholder of the right length instead of
    /// computing.
    pub fn should_skip(&self) -> bool {
        self.skip_output
    }

    /// Pull the next block from input `i`. `None` is end-of-stream.
    pub fn get_next(&mut self, i: usize) -> Result<Option<Rc<RowBatch>>> {
        let edge = self.input(i)?;
        edge.node.get_next(edge.consumer_id, false)
    }

    /// Tell input `i` its next block is not needed; a placeholder with the
    /// correct row count comes back so rate coupling stays observable.
    pub fn skip_next(&mut self, i: usize) -> Result<Option<Rc<RowBatch>>> {
        let edge = self.input(i)?;
        edge.node.get_next(edge.consumer_id, true)
    }

    /// Yield one block downstream. At most one emit per execute step.
    pub fn emit(&mut self, batch: RowBatch) -> Result<EmitState> {
        if self.emitted.is_some() {
            return Err(SfqError::Internal(
                "operator emitted more than one block in a single step".into(),
            ));
        }
        self.emitted = Some(batch);
        if self.cancel.is_cancelled() {
            Ok(EmitState::Stop)
        } else {
            Ok(EmitState::Continue)
        }
    }

    pub(crate) fn take_emitted(&mut self) -> Option<RowBatch> {
        self.emitted.take()
    }

    fn input(&self, i: usize) -> Result<&InputEdge> {
        self.inputs.get(i).ok_or_else(|| {
            SfqError::Internal(format!(
                "operator pulled input {i} but has {}",
                self.inputs.len()
            ))
        })
    }
}
