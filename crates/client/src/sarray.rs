//! Lazy typed columns.
//!
//! An `SArray` wraps a plan tip; builder methods grow the plan and nothing
//! runs until a materializing call (`materialize`, `to_vec`, `reduce`,
//! `head`, `num_rows` on an unknown-length plan). After a materializing
//! call the wrapped tip has been rewritten in place to a stored source, so
//! repeated reads are cheap.

use std::path::Path;
use std::sync::{Arc, Mutex};

use sfq_common::{Cell, CellType, Result, SfqError};
use sfq_engine::{
    infer_dtype, infer_length, make_append_node, make_constant_node, make_lambda_transform_node,
    make_logical_filter_node, make_range_node, make_reduce_node, make_sarray_source_node,
    make_transform_node, BinaryMapFn, LambdaSpec, MaterializeOptions, NodeRef, ReduceFunction,
    RowMapFn, SumReducer,
};

use crate::session::SharedSession;

/// A lazy, immutable, typed column.
#[derive(Clone)]
pub struct SArray {
    session: SharedSession,
    node: NodeRef,
}

impl SArray {
    pub(crate) fn wrap(session: SharedSession, node: NodeRef) -> Self {
        Self { session, node }
    }

    /// Write `cells` to scratch storage and wrap them.
    pub fn from_cells(
        session: SharedSession,
        cells: Vec<Cell>,
        dtype: CellType,
    ) -> Result<Self> {
        let segments = session.config().write_num_segments;
        let column = sfq_storage::SArray::from_cells(cells, dtype, segments)?;
        Ok(Self::from_storage(session, column))
    }

    /// Wrap an already stored column.
    pub fn from_storage(session: SharedSession, column: sfq_storage::SArray) -> Self {
        Self::wrap(session, make_sarray_source_node(column))
    }

    /// Open a stored column archive.
    pub fn open(session: SharedSession, path: &Path) -> Result<Self> {
        let column = sfq_storage::open_sarray(path)?;
        Ok(Self::from_storage(session, column))
    }

    /// The integers `[begin, end)`.
    pub fn range(session: SharedSession, begin: u64, end: u64) -> Result<Self> {
        Ok(Self::wrap(session, make_range_node(begin, end)?))
    }

    /// `size` copies of `value`.
    pub fn constant(session: SharedSession, value: Cell, size: u64) -> Self {
        Self::wrap(session, make_constant_node(value, size))
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub(crate) fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn dtype(&self) -> Result<CellType> {
        Ok(infer_dtype(&self.node)?[0])
    }

    /// Row count when it is knowable without running the plan.
    pub fn len_hint(&self) -> Result<Option<u64>> {
        infer_length(&self.node)
    }

    /// Row count, materializing if the plan cannot say.
    pub fn num_rows(&self) -> Result<u64> {
        if let Some(n) = self.len_hint()? {
            return Ok(n);
        }
        Ok(self.materialize()?.len())
    }

    /// Lazily apply `f` row-wise.
    pub fn apply(&self, f: Arc<RowMapFn>, output_type: CellType) -> Result<SArray> {
        Ok(Self::wrap(
            self.session.clone(),
            make_transform_node(self.node.clone(), f, output_type)?,
        ))
    }

    /// Lazily apply a worker-evaluated lambda row-wise, through the
    /// session's lambda channel.
    pub fn apply_external(
        &self,
        code: &str,
        output_type: CellType,
        skip_undefined: bool,
        seed: u64,
    ) -> Result<SArray> {
        let channel = self.session.lambda_channel().ok_or_else(|| {
            SfqError::InvalidPlan("no lambda channel installed on this session".into())
        })?;
        let spec = LambdaSpec {
            code: code.to_string(),
            channel,
            skip_undefined,
            seed,
        };
        Ok(Self::wrap(
            self.session.clone(),
            make_lambda_transform_node(self.node.clone(), spec, output_type)?,
        ))
    }

    /// Lazily combine with `other` element-wise.
    pub fn zip_with(
        &self,
        other: &SArray,
        f: Arc<BinaryMapFn>,
        output_type: CellType,
    ) -> Result<SArray> {
        Ok(Self::wrap(
            self.session.clone(),
            sfq_engine::make_binary_transform_node(
                self.node.clone(),
                other.node.clone(),
                f,
                output_type,
            )?,
        ))
    }

    /// Keep rows where `mask` is truthy.
    pub fn filter(&self, mask: &SArray) -> Result<SArray> {
        Ok(Self::wrap(
            self.session.clone(),
            make_logical_filter_node(self.node.clone(), mask.node.clone())?,
        ))
    }

    /// This column's rows followed by `other`'s.
    pub fn append(&self, other: &SArray) -> Result<SArray> {
        Ok(Self::wrap(
            self.session.clone(),
            make_append_node(self.node.clone(), other.node.clone())?,
        ))
    }

    /// Fold to a single cell.
    pub fn reduce(&self, reducer: Arc<dyn ReduceFunction>) -> Result<Cell> {
        let tip = make_reduce_node(self.node.clone(), reducer)?;
        let frame = self
            .session
            .planner()
            .materialize(&tip, MaterializeOptions::default())?;
        let cells = frame.column(0).to_vec()?;
        cells
            .into_iter()
            .next()
            .ok_or_else(|| SfqError::Internal("reduce produced no rows".into()))
    }

    pub fn sum(&self) -> Result<Cell> {
        self.reduce(Arc::new(SumReducer))
    }

    /// First `n` cells, stopping the pipeline once it has them.
    pub fn head(&self, n: usize) -> Result<Vec<Cell>> {
        let collected = Arc::new(Mutex::new(Vec::with_capacity(n)));
        let sink = collected.clone();
        let mut opts = MaterializeOptions {
            // one segment keeps the prefix in row order
            num_segments: 1,
            ..MaterializeOptions::default()
        };
        opts.write_callback = Some(Arc::new(move |_segment, block: &sfq_engine::RowBatch| {
            let mut rows = sink.lock().expect("head sink lock poisoned");
            for cell in block.column(0) {
                if rows.len() >= n {
                    return Ok(true);
                }
                rows.push(cell.clone());
            }
            Ok(rows.len() >= n)
        }));
        self.session.planner().materialize(&self.node, opts)?;
        let mut rows = collected.lock().expect("head sink lock poisoned").clone();
        rows.truncate(n);
        Ok(rows)
    }

    /// Run the plan and return the stored column.
    pub fn materialize(&self) -> Result<sfq_storage::SArray> {
        let frame = self
            .session
            .planner()
            .materialize(&self.node, MaterializeOptions::default())?;
        Ok(frame.column(0).clone())
    }

    /// Materialize into memory.
    pub fn to_vec(&self) -> Result<Vec<Cell>> {
        self.materialize()?.to_vec()
    }

    /// Materialize and persist as a directory archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        let column = self.materialize()?;
        sfq_storage::save_sarray(&column, path)
    }

    /// Advises materializing now if the lazy plan has grown very deep.
    pub fn materialization_recommended(&self) -> bool {
        self.session
            .planner()
            .online_materialization_recommended(&self.node)
    }
}

impl std::fmt::Debug for SArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SArray")
            .field("dtype", &self.dtype().ok())
            .field("len", &self.len_hint().ok().flatten())
            .finish()
    }
}
