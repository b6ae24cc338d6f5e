//! Execution nodes: the runtime wrapper that turns an operator into a
//! pullable stream shared by any number of consumers.
//!
//! Each node owns its operator, an output FIFO of at most two blocks, and a
//! position cursor per registered consumer. A consumer pulls with
//! `get_next(consumer_id, skip)`; when the requested block is not buffered
//! the node runs one operator step to produce it. The operator's pulls
//! recurse into the input nodes, so within one segment exactly one operator
//! is ever running: control threads down the pipeline and back exactly at
//! the two sanctioned suspension points (pull and emit).
//!
//! Rate coupling: all consumers of one producer advance in lock step, so the
//! FIFO never needs more than the newest block plus one predecessor for a
//! lagging consumer. A consumer trying to run two blocks ahead of a peer is
//! an invariant violation and latches `Internal`.
//!
//! Skip handling: each pull records the consumer's skip vote for the next
//! block; the block is produced as a placeholder only when every consumer
//! voted to skip it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use sfq_common::{CancelFlag, Result, SfqError};

use crate::execution::batch::RowBatch;
use crate::execution::context::QueryContext;
use crate::execution::operators::QueryOperator;

/// Where a node pulls one of its inputs from.
pub struct InputEdge {
    pub node: Rc<ExecutionNode>,
    pub consumer_id: usize,
}

struct NodeState {
    /// Buffered output blocks; front is block id `base`.
    queue: VecDeque<Rc<RowBatch>>,
    base: usize,
    /// consumer_pos[i] is the block id consumer i reads next.
    consumer_pos: Vec<usize>,
    /// Latest skip vote per consumer.
    skip_votes: Vec<bool>,
    done: bool,
    exception: Option<SfqError>,
}

impl NodeState {
    fn fresh(num_consumers: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            base: 0,
            consumer_pos: vec![0; num_consumers],
            skip_votes: vec![false; num_consumers],
            done: false,
            exception: None,
        }
    }
}

/// Runtime wrapper around one operator instance.
pub struct ExecutionNode {
    op: RefCell<Box<dyn QueryOperator>>,
    inputs: Vec<InputEdge>,
    state: RefCell<NodeState>,
    cancel: CancelFlag,
    batch_size: usize,
}

impl ExecutionNode {
    /// Wire an operator to its input nodes. Resets the operator.
    pub fn new(
        mut op: Box<dyn QueryOperator>,
        inputs: Vec<InputEdge>,
        cancel: CancelFlag,
        batch_size: usize,
    ) -> Rc<Self> {
        op.reset();
        Rc::new(Self {
            op: RefCell::new(op),
            inputs,
            state: RefCell::new(NodeState::fresh(0)),
            cancel,
            batch_size,
        })
    }

    /// Add a consumer; the returned id names it in every later `get_next`.
    pub fn register_consumer(&self) -> usize {
        let mut st = self.state.borrow_mut();
        st.consumer_pos.push(0);
        st.skip_votes.push(false);
        st.consumer_pos.len() - 1
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_node(&self, i: usize) -> Rc<ExecutionNode> {
        self.inputs[i].node.clone()
    }

    /// Any failure latched while running this node's operator.
    pub fn exception(&self) -> Option<SfqError> {
        self.state.borrow().exception.clone()
    }

    /// Reset operator and all stream state. Not recursive: the caller walks
    /// the graph, since shared upstream nodes must be reset exactly once.
    pub fn reset(&self) {
        self.op.borrow_mut().reset();
        let mut st = self.state.borrow_mut();
        let n = st.consumer_pos.len();
        *st = NodeState::fresh(n);
    }

    /// Next block for `consumer`; `None` at end of stream.
    ///
    /// `skip` marks the consumer's vote that it does not need the block's
    /// payload, only its shape.
    pub fn get_next(&self, consumer: usize, skip: bool) -> Result<Option<Rc<RowBatch>>> {
        loop {
            {
                let mut st = self.state.borrow_mut();
                if let Some(e) = &st.exception {
                    return Err(e.clone());
                }
                st.skip_votes[consumer] = skip;
                let pos = st.consumer_pos[consumer];
                if pos < st.base {
                    let e = SfqError::Internal(
                        "consumer fell behind the retained output window".into(),
                    );
                    st.exception = Some(e.clone());
                    return Err(e);
                }
                if pos < st.base + st.queue.len() {
                    // buffered: serve and advance
                    let batch = st.queue[pos - st.base].clone();
                    st.consumer_pos[consumer] = pos + 1;
                    let min_pos = *st.consumer_pos.iter().min().expect("has consumers");
                    while st.base < min_pos && !st.queue.is_empty() {
                        st.queue.pop_front();
                        st.base += 1;
                    }
                    return Ok(Some(batch));
                }
                if st.done {
                    return Ok(None);
                }
                // producing block `pos` for this consumer: every peer must
                // already be within one block of it
                let min_pos = *st.consumer_pos.iter().min().expect("has consumers");
                if pos > min_pos + 1 {
                    let e = SfqError::Internal(format!(
                        "rate coupling violated: consumer requested block {pos} while \
                         another is still at {min_pos}"
                    ));
                    st.exception = Some(e.clone());
                    return Err(e);
                }
            }
            self.produce_one()?;
        }
    }

    /// Run one operator step and append its output (if any) to the FIFO.
    fn produce_one(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            let mut st = self.state.borrow_mut();
            st.exception = Some(SfqError::Cancelled);
            return Err(SfqError::Cancelled);
        }
        let skip_block = {
            let st = self.state.borrow();
            !st.skip_votes.is_empty() && st.skip_votes.iter().all(|&s| s)
        };

        let step = {
            let mut op = self.op.borrow_mut();
            let mut ctx =
                QueryContext::new(&self.inputs, self.batch_size, skip_block, &self.cancel);
            match op.execute(&mut ctx) {
                Ok(()) => Ok(ctx.take_emitted()),
                Err(e) => Err(e),
            }
        };

        let mut st = self.state.borrow_mut();
        match step {
            Ok(Some(batch)) => {
                st.queue.push_back(Rc::new(batch));
                if st.queue.len() > 2 {
                    let e = SfqError::Internal(
                        "output FIFO exceeded two blocks; consumers are not rate coupled".into(),
                    );
                    st.exception = Some(e.clone());
                    return Err(e);
                }
                Ok(())
            }
            Ok(None) => {
                st.done = true;
                Ok(())
            }
            Err(e) => {
                st.exception = Some(e.clone());
                Err(e)
            }
        }
    }
}
