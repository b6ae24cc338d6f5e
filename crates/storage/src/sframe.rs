//! Frames: ordered collections of named, equal-length columns.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sfq_common::{CellType, Result, SfqError};
use tempfile::TempDir;

use crate::archive::{write_archive_descriptor, ArchiveKind};
use crate::column::{
    read_column_index, write_column_index, ColumnWriter, SegmentMeta, SegmentWriter,
};
use crate::sarray::SArray;

/// Frame index file name inside a directory archive.
pub const FRAME_INDEX_FILE: &str = "frame.fidx";

/// Current frame index format version.
pub const FRAME_INDEX_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameIndex {
    version: u32,
    nrows: u64,
    column_names: Vec<String>,
    /// Column index files, relative to the frame directory.
    column_files: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// An ordered collection of named, equal-length columns.
///
/// Cheap to clone; column handles are shared. Immutable: "mutations"
/// (select, rename, add) build new frames over the same backing columns.
#[derive(Clone)]
pub struct SFrame {
    columns: Vec<SArray>,
    names: Vec<String>,
}

impl SFrame {
    pub fn from_columns(columns: Vec<SArray>, names: Vec<String>) -> Result<Self> {
        if columns.len() != names.len() {
            return Err(SfqError::InvalidPlan(format!(
                "{} columns but {} names",
                columns.len(),
                names.len()
            )));
        }
        if let Some(first) = columns.first() {
            for (c, n) in columns.iter().zip(&names) {
                if c.len() != first.len() {
                    return Err(SfqError::InvalidPlan(format!(
                        "column {n} has {} rows, expected {}",
                        c.len(),
                        first.len()
                    )));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for n in &names {
            if !seen.insert(n.as_str()) {
                return Err(SfqError::InvalidPlan(format!("duplicate column name {n}")));
            }
        }
        Ok(Self { columns, names })
    }

    /// An empty zero-column, zero-row frame.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            names: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> u64 {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, idx: usize) -> &SArray {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[SArray] {
        &self.columns
    }

    pub fn column_dtypes(&self) -> Vec<CellType> {
        self.columns.iter().map(|c| c.dtype()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn select_column(&self, name: &str) -> Result<SArray> {
        self.column_index(name)
            .map(|i| self.columns[i].clone())
            .ok_or_else(|| SfqError::InvalidPlan(format!("unknown column {name}")))
    }

    /// Column subset/reorder by index. Handles are shared, not copied.
    pub fn select_columns(&self, indices: &[usize]) -> Result<Self> {
        let mut columns = Vec::with_capacity(indices.len());
        let mut names = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.columns.len() {
                return Err(SfqError::InvalidPlan(format!(
                    "column index {i} out of range ({} columns)",
                    self.columns.len()
                )));
            }
            columns.push(self.columns[i].clone());
            // selecting the same column twice needs a fresh name
            let mut name = self.names[i].clone();
            while names.contains(&name) {
                name.push('\'');
            }
            names.push(name);
        }
        SFrame::from_columns(columns, names)
    }

    pub fn with_column_names(&self, names: Vec<String>) -> Result<Self> {
        SFrame::from_columns(self.columns.clone(), names)
    }

    /// Horizontal concat of two frames over the same rows.
    pub fn with_columns_from(&self, other: &SFrame) -> Result<Self> {
        if self.num_columns() > 0 && other.num_columns() > 0 && self.num_rows() != other.num_rows()
        {
            return Err(SfqError::InvalidPlan(format!(
                "cannot combine frames of {} and {} rows",
                self.num_rows(),
                other.num_rows()
            )));
        }
        let mut columns = self.columns.clone();
        let mut names = self.names.clone();
        for (c, n) in other.columns.iter().zip(&other.names) {
            let mut name = n.clone();
            while names.contains(&name) {
                name.push('\'');
            }
            columns.push(c.clone());
            names.push(name);
        }
        SFrame::from_columns(columns, names)
    }

    /// Persist as a directory archive: descriptor + frame index + one column
    /// index and its segment files per column.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut column_files = Vec::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            let file = copy_column_into(col, dir, &format!("col_{i}"))?;
            column_files.push(file);
        }
        let index = FrameIndex {
            version: FRAME_INDEX_VERSION,
            nrows: self.num_rows(),
            column_names: self.names.clone(),
            column_files,
            metadata: BTreeMap::new(),
        };
        let text = serde_json::to_string_pretty(&index)
            .map_err(|e| SfqError::Storage(format!("frame index encode failed: {e}")))?;
        let index_path = dir.join(FRAME_INDEX_FILE);
        let tmp = dir.join(format!("{FRAME_INDEX_FILE}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &index_path)?;
        write_archive_descriptor(dir, ArchiveKind::SFrame)?;
        Ok(())
    }

    /// Open a saved frame directory archive.
    pub fn open(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join(FRAME_INDEX_FILE))?;
        let index: FrameIndex = serde_json::from_str(&text)
            .map_err(|e| SfqError::Storage(format!("bad frame index in {}: {e}", dir.display())))?;
        let mut columns = Vec::with_capacity(index.column_files.len());
        for file in &index.column_files {
            columns.push(SArray::open(&dir.join(file))?);
        }
        SFrame::from_columns(columns, index.column_names)
    }
}

impl PartialEq for SFrame {
    /// Handle identity: same column handles under the same names.
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.ptr_eq(b))
    }
}

impl std::fmt::Debug for SFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SFrame")
            .field("columns", &self.names)
            .field("rows", &self.num_rows())
            .finish()
    }
}

/// Copy a column's segment files into `dir` under a fresh name and write a
/// matching index there. Returns the index file name relative to `dir`.
fn copy_column_into(col: &SArray, dir: &Path, name: &str) -> Result<String> {
    let src_index = col.index();
    let src_dir = col.index_path().parent().expect("index path has parent");
    let mut index = src_index.clone();
    index.segment_files.clear();
    for (s, file) in src_index.segment_files.iter().enumerate() {
        let dst_name = format!("{name}_seg_{s:04}.bin");
        fs::copy(src_dir.join(file), dir.join(&dst_name))?;
        index.segment_files.push(dst_name);
    }
    let index_file = format!("{name}.sidx");
    write_column_index(&dir.join(&index_file), &index)?;
    Ok(index_file)
}

/// Builds a frame out of per-segment, per-column streams.
///
/// Workers detach one [`FrameSegmentWriter`] each; the finished segment
/// metadata comes back in segment order at [`FrameWriter::close`], which
/// commits every column and assembles the frame.
pub struct FrameWriter {
    scratch: Arc<TempDir>,
    writers: Vec<ColumnWriter>,
    num_segments: usize,
}

/// Per-segment writer across all columns of a frame.
pub struct FrameSegmentWriter {
    segments: Vec<SegmentWriter>,
}

/// Finished per-segment metadata, one entry per column.
pub struct FrameSegmentMeta {
    columns: Vec<SegmentMeta>,
}

impl FrameWriter {
    /// A scratch-directory frame writer. The resulting frame's columns share
    /// the scratch directory and keep it alive.
    pub fn new_scratch(num_columns: usize, num_segments: usize) -> Result<Self> {
        let scratch = Arc::new(tempfile::Builder::new().prefix("sfq-frame-").tempdir()?);
        let mut writers = Vec::with_capacity(num_columns);
        for i in 0..num_columns {
            writers.push(ColumnWriter::open(
                scratch.path(),
                &format!("col_{i}"),
                num_segments.max(1),
            )?);
        }
        Ok(Self {
            scratch,
            writers,
            num_segments: num_segments.max(1),
        })
    }

    pub fn set_dtypes(&mut self, dtypes: &[CellType]) -> Result<()> {
        if dtypes.len() != self.writers.len() {
            return Err(SfqError::Internal(format!(
                "{} dtypes for {} columns",
                dtypes.len(),
                self.writers.len()
            )));
        }
        for (w, t) in self.writers.iter_mut().zip(dtypes) {
            w.set_dtype(*t);
        }
        Ok(())
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn segment_writer(&mut self, segment: usize) -> Result<FrameSegmentWriter> {
        let mut segments = Vec::with_capacity(self.writers.len());
        for w in &mut self.writers {
            segments.push(w.segment_writer(segment)?);
        }
        Ok(FrameSegmentWriter { segments })
    }

    /// Commit all columns. `segments` must be in segment order.
    pub fn close(self, segments: Vec<FrameSegmentMeta>, names: Vec<String>) -> Result<SFrame> {
        if segments.len() != self.num_segments {
            return Err(SfqError::Internal(format!(
                "frame writer closed with {} of {} segments",
                segments.len(),
                self.num_segments
            )));
        }
        let ncols = self.writers.len();
        // transpose [segment][column] -> [column][segment]
        let mut per_column: Vec<Vec<SegmentMeta>> = (0..ncols).map(|_| Vec::new()).collect();
        for seg in segments {
            if seg.columns.len() != ncols {
                return Err(SfqError::Internal(
                    "segment meta column count mismatch".into(),
                ));
            }
            for (c, meta) in seg.columns.into_iter().enumerate() {
                per_column[c].push(meta);
            }
        }
        let mut columns = Vec::with_capacity(ncols);
        for (w, metas) in self.writers.into_iter().zip(per_column) {
            let index_path = w.close(metas)?;
            let index = read_column_index(&index_path)?;
            columns.push(SArray::from_parts(
                index,
                index_path,
                Some(self.scratch.clone()),
            ));
        }
        let names = if names.is_empty() {
            (1..=ncols).map(|i| format!("X{i}")).collect()
        } else {
            names
        };
        SFrame::from_columns(columns, names)
    }
}

impl FrameSegmentWriter {
    pub fn num_columns(&self) -> usize {
        self.segments.len()
    }

    /// Append one row across all columns.
    pub fn write_row(&mut self, row: &[sfq_common::Cell]) -> Result<()> {
        if row.len() != self.segments.len() {
            return Err(SfqError::Internal(format!(
                "row of {} cells for {} columns",
                row.len(),
                self.segments.len()
            )));
        }
        for (w, cell) in self.segments.iter_mut().zip(row) {
            w.write(cell)?;
        }
        Ok(())
    }

    /// Append a columnar block; the column vectors must be equal length.
    pub fn write_columns(&mut self, columns: &[Vec<sfq_common::Cell>]) -> Result<()> {
        if columns.len() != self.segments.len() {
            return Err(SfqError::Internal(format!(
                "block of {} columns for {} writers",
                columns.len(),
                self.segments.len()
            )));
        }
        for (w, col) in self.segments.iter_mut().zip(columns) {
            for cell in col {
                w.write(cell)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<FrameSegmentMeta> {
        let mut columns = Vec::with_capacity(self.segments.len());
        for s in self.segments {
            columns.push(s.finish()?);
        }
        Ok(FrameSegmentMeta { columns })
    }
}
