//! The out-of-process lambda worker, seen from the engine side.
//!
//! The engine only ever talks through [`LambdaChannel`]: create a lambda
//! from a code blob, bulk-evaluate row batches against it, release it, and
//! ping for liveness. A transport that actually crosses process boundaries
//! lives outside this crate; [`InProcessLambdaChannel`] is the in-process
//! registry used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sfq_common::{Cell, Result, SfqError};

/// Row-evaluation function registered with the in-process channel.
pub type LambdaEvalFn = dyn Fn(&[Cell]) -> Result<Cell> + Send + Sync;

/// Request/reply surface of a lambda evaluation worker.
pub trait LambdaChannel: Send + Sync {
    /// Compile/register a lambda from its code blob, returning its handle.
    fn make_lambda(&self, code: &str) -> Result<u64>;

    /// Evaluate a batch of rows. `skip_undefined` short-circuits rows that
    /// contain an undefined cell to undefined without invoking the lambda;
    /// `seed` makes stochastic lambdas reproducible per query.
    fn bulk_eval(
        &self,
        lambda_id: u64,
        rows: &[Vec<Cell>],
        skip_undefined: bool,
        seed: u64,
    ) -> Result<Vec<Cell>>;

    /// Drop a lambda handle on the worker.
    fn release_lambda(&self, lambda_id: u64) -> Result<()>;

    /// Liveness probe. Errors accumulate into `Unreachable` on the caller
    /// side.
    fn ping(&self) -> Result<()>;
}

/// In-process lambda registry.
///
/// Code blobs are looked up against functions registered beforehand, which
/// stands in for the worker-side compile step.
#[derive(Default)]
pub struct InProcessLambdaChannel {
    registry: Mutex<HashMap<String, Arc<LambdaEvalFn>>>,
    active: Mutex<HashMap<u64, Arc<LambdaEvalFn>>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
}

impl InProcessLambdaChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the evaluator behind a code blob.
    pub fn register(&self, code: &str, f: Arc<LambdaEvalFn>) {
        self.registry
            .lock()
            .expect("lambda registry lock poisoned")
            .insert(code.to_string(), f);
    }

    /// Simulate worker death (tests).
    pub fn set_unreachable(&self, dead: bool) {
        self.unreachable.store(dead, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("lambda table lock poisoned").len()
    }

    fn check_alive(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(SfqError::Unreachable("lambda worker not responding".into()))
        } else {
            Ok(())
        }
    }
}

impl LambdaChannel for InProcessLambdaChannel {
    fn make_lambda(&self, code: &str) -> Result<u64> {
        self.check_alive()?;
        let f = self
            .registry
            .lock()
            .expect("lambda registry lock poisoned")
            .get(code)
            .cloned()
            .ok_or_else(|| {
                SfqError::InvalidPlan(format!("no registered lambda for code blob {code:?}"))
            })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .expect("lambda table lock poisoned")
            .insert(id, f);
        Ok(id)
    }

    fn bulk_eval(
        &self,
        lambda_id: u64,
        rows: &[Vec<Cell>],
        skip_undefined: bool,
        _seed: u64,
    ) -> Result<Vec<Cell>> {
        self.check_alive()?;
        let f = self
            .active
            .lock()
            .expect("lambda table lock poisoned")
            .get(&lambda_id)
            .cloned()
            .ok_or_else(|| {
                SfqError::Internal(format!("bulk_eval on unknown lambda {lambda_id}"))
            })?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if skip_undefined && row.iter().any(Cell::is_undefined) {
                out.push(Cell::Undefined);
            } else {
                out.push(f(row)?);
            }
        }
        Ok(out)
    }

    fn release_lambda(&self, lambda_id: u64) -> Result<()> {
        self.active
            .lock()
            .expect("lambda table lock poisoned")
            .remove(&lambda_id);
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.check_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double() -> Arc<LambdaEvalFn> {
        Arc::new(|row: &[Cell]| {
            Ok(Cell::Integer(row[0].as_integer().unwrap_or(0) * 2))
        })
    }

    #[test]
    fn lambda_lifecycle() {
        let chan = InProcessLambdaChannel::new();
        chan.register("x*2", double());
        let id = chan.make_lambda("x*2").unwrap();
        let out = chan
            .bulk_eval(id, &[vec![Cell::Integer(3)], vec![Cell::Integer(5)]], false, 0)
            .unwrap();
        assert_eq!(out, vec![Cell::Integer(6), Cell::Integer(10)]);
        chan.release_lambda(id).unwrap();
        assert_eq!(chan.active_count(), 0);
    }

    #[test]
    fn skip_undefined_short_circuits() {
        let chan = InProcessLambdaChannel::new();
        chan.register("x*2", double());
        let id = chan.make_lambda("x*2").unwrap();
        let out = chan
            .bulk_eval(id, &[vec![Cell::Undefined], vec![Cell::Integer(1)]], true, 0)
            .unwrap();
        assert_eq!(out, vec![Cell::Undefined, Cell::Integer(2)]);
    }

    #[test]
    fn dead_worker_is_unreachable() {
        let chan = InProcessLambdaChannel::new();
        chan.register("x*2", double());
        chan.set_unreachable(true);
        assert!(matches!(
            chan.make_lambda("x*2"),
            Err(SfqError::Unreachable(_))
        ));
    }
}
