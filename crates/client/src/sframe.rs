//! Lazy frames: named, equal-length lazy columns over one plan tip.
//!
//! The plan carries no column names; the handle does, exactly as wide as
//! the tip's output. Builder methods compose projections, unions, appends,
//! and filters without running anything.

use std::path::Path;
use std::sync::{Arc, Mutex};

use sfq_common::{Cell, CellType, Result, SfqError};
use sfq_engine::{
    infer_length, infer_num_columns, make_append_node, make_generalized_transform_node,
    make_logical_filter_node, make_project_node, make_sframe_source_node, make_union_node,
    MaterializeOptions, MultiMapFn, NodeRef,
};

use crate::sarray::SArray;
use crate::session::SharedSession;

/// A lazy, immutable frame.
#[derive(Clone)]
pub struct SFrame {
    session: SharedSession,
    node: NodeRef,
    names: Vec<String>,
}

impl SFrame {
    pub(crate) fn wrap(session: SharedSession, node: NodeRef, names: Vec<String>) -> Result<Self> {
        let ncols = infer_num_columns(&node)?;
        if ncols != names.len() {
            return Err(SfqError::Internal(format!(
                "{} names for a {ncols}-column plan",
                names.len()
            )));
        }
        Ok(Self {
            session,
            node,
            names,
        })
    }

    /// Build a frame from named lazy columns of equal length.
    pub fn from_columns(columns: Vec<(String, SArray)>) -> Result<Self> {
        if columns.is_empty() {
            return Err(SfqError::InvalidPlan(
                "a frame needs at least one column".into(),
            ));
        }
        let session = columns[0].1.session().clone();
        let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        let node = if columns.len() == 1 {
            columns[0].1.node().clone()
        } else {
            make_union_node(columns.iter().map(|(_, c)| c.node().clone()).collect())?
        };
        Self::wrap(session, node, names)
    }

    /// Wrap an already stored frame.
    pub fn from_storage(session: SharedSession, frame: sfq_storage::SFrame) -> Result<Self> {
        let names = frame.column_names().to_vec();
        Self::wrap(session, make_sframe_source_node(frame), names)
    }

    /// Open a stored frame archive.
    pub fn open(session: SharedSession, path: &Path) -> Result<Self> {
        let frame = sfq_storage::SFrame::open(path)?;
        Self::from_storage(session, frame)
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn num_columns(&self) -> usize {
        self.names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Row count when it is knowable without running the plan.
    pub fn len_hint(&self) -> Result<Option<u64>> {
        infer_length(&self.node)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| SfqError::InvalidPlan(format!("unknown column {name}")))
    }

    /// One column as a lazy array.
    pub fn column(&self, name: &str) -> Result<SArray> {
        let idx = self.column_index(name)?;
        let node = make_project_node(self.node.clone(), vec![idx])?;
        Ok(SArray::wrap(self.session.clone(), node))
    }

    /// Column subset/reorder by name.
    pub fn select_columns(&self, names: &[&str]) -> Result<SFrame> {
        let indices = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>>>()?;
        let node = make_project_node(self.node.clone(), indices)?;
        Self::wrap(
            self.session.clone(),
            node,
            names.iter().map(|n| n.to_string()).collect(),
        )
    }

    /// This frame plus one more column of the same length.
    pub fn add_column(&self, name: &str, column: &SArray) -> Result<SFrame> {
        if self.names.iter().any(|n| n == name) {
            return Err(SfqError::InvalidPlan(format!(
                "column {name} already exists"
            )));
        }
        let node = make_union_node(vec![self.node.clone(), column.node().clone()])?;
        let mut names = self.names.clone();
        names.push(name.to_string());
        Self::wrap(self.session.clone(), node, names)
    }

    /// Rows of this frame followed by rows of `other` (same columns).
    pub fn append(&self, other: &SFrame) -> Result<SFrame> {
        if self.names != other.names {
            return Err(SfqError::InvalidPlan(format!(
                "cannot append frame with columns {:?} onto {:?}",
                other.names, self.names
            )));
        }
        let node = make_append_node(self.node.clone(), other.node.clone())?;
        Self::wrap(self.session.clone(), node, self.names.clone())
    }

    /// Keep rows where `mask` is truthy.
    pub fn filter_by(&self, mask: &SArray) -> Result<SFrame> {
        let node = make_logical_filter_node(self.node.clone(), mask.node().clone())?;
        Self::wrap(self.session.clone(), node, self.names.clone())
    }

    /// Lazily map every row to a new multi-column row.
    pub fn apply_rows(
        &self,
        f: Arc<MultiMapFn>,
        output_types: Vec<CellType>,
        output_names: Vec<String>,
    ) -> Result<SFrame> {
        if output_types.len() != output_names.len() {
            return Err(SfqError::InvalidPlan(format!(
                "{} output types but {} names",
                output_types.len(),
                output_names.len()
            )));
        }
        let node = make_generalized_transform_node(self.node.clone(), f, output_types)?;
        Self::wrap(self.session.clone(), node, output_names)
    }

    /// First `n` rows, stopping the pipeline once it has them.
    pub fn head(&self, n: usize) -> Result<Vec<Vec<Cell>>> {
        let collected: Arc<Mutex<Vec<Vec<Cell>>>> = Arc::new(Mutex::new(Vec::with_capacity(n)));
        let sink = collected.clone();
        let mut opts = MaterializeOptions {
            num_segments: 1,
            ..MaterializeOptions::default()
        };
        opts.write_callback = Some(Arc::new(move |_segment, block: &sfq_engine::RowBatch| {
            let mut rows = sink.lock().expect("head sink lock poisoned");
            for row in block.rows() {
                if rows.len() >= n {
                    return Ok(true);
                }
                rows.push(row.to_vec());
            }
            Ok(rows.len() >= n)
        }));
        self.session.planner().materialize(&self.node, opts)?;
        let mut rows = collected.lock().expect("head sink lock poisoned").clone();
        rows.truncate(n);
        Ok(rows)
    }

    /// Run the plan and return the stored frame, with this handle's
    /// column names.
    pub fn materialize(&self) -> Result<sfq_storage::SFrame> {
        let opts = MaterializeOptions {
            output_column_names: self.names.clone(),
            ..MaterializeOptions::default()
        };
        self.session.planner().materialize(&self.node, opts)
    }

    /// Materialize and persist as a directory archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        let opts = MaterializeOptions {
            output_column_names: self.names.clone(),
            output_path: Some(path.to_path_buf()),
            ..MaterializeOptions::default()
        };
        self.session.planner().materialize(&self.node, opts)?;
        Ok(())
    }
}

impl std::fmt::Debug for SFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SFrame")
            .field("columns", &self.names)
            .field("len", &self.len_hint().ok().flatten())
            .finish()
    }
}
