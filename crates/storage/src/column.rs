//! The segmented column format.
//!
//! A column on disk is a JSON index file (`*.sidx`) naming the segment
//! files, their row counts, the declared cell type, and free-form metadata,
//! plus one binary segment file per segment. Segment files are read with
//! independent file handles, so multiple workers can scan one column
//! concurrently.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sfq_common::{Cell, CellType, Result, SfqError};

use crate::encode::{read_cell, write_cell};

/// Current column index format version.
pub const COLUMN_INDEX_VERSION: u32 = 2;

/// Everything the index file records about a column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnIndex {
    pub version: u32,
    pub dtype: CellType,
    /// Segment file names, relative to the index file's directory.
    pub segment_files: Vec<String>,
    /// Rows per segment; parallel to `segment_files`.
    pub segment_sizes: Vec<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ColumnIndex {
    pub fn num_segments(&self) -> usize {
        self.segment_files.len()
    }

    pub fn total_rows(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }
}

/// Read and validate a column index file.
pub fn read_column_index(path: &Path) -> Result<ColumnIndex> {
    let text = fs::read_to_string(path)?;
    let index: ColumnIndex = serde_json::from_str(&text)
        .map_err(|e| SfqError::Storage(format!("bad column index {}: {e}", path.display())))?;
    if index.segment_files.len() != index.segment_sizes.len() {
        return Err(SfqError::Storage(format!(
            "column index {}: {} segment files but {} sizes",
            path.display(),
            index.segment_files.len(),
            index.segment_sizes.len()
        )));
    }
    Ok(index)
}

/// Write a column index file, atomically (write to a temp name, then rename).
pub fn write_column_index(path: &Path, index: &ColumnIndex) -> Result<()> {
    let text = serde_json::to_string_pretty(index)
        .map_err(|e| SfqError::Storage(format!("column index encode failed: {e}")))?;
    let tmp = path.with_extension("sidx.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Typed cell iterator over one segment of a column.
///
/// Owns its file handle; yields exactly the indexed row count.
pub struct SegmentReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl SegmentReader {
    pub fn open(segment_path: &Path, rows: u64) -> Result<Self> {
        let file = File::open(segment_path)?;
        Ok(Self {
            reader: BufReader::new(file),
            remaining: rows,
        })
    }
}

impl Iterator for SegmentReader {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(read_cell(&mut self.reader))
    }
}

/// Streaming writer for one segment of a column.
///
/// Detached from its [`ColumnWriter`] so each parallel worker owns its own
/// handle; [`SegmentWriter::finish`] hands the row count back for the index.
pub struct SegmentWriter {
    writer: BufWriter<File>,
    dtype: CellType,
    file_name: String,
    rows: u64,
}

impl SegmentWriter {
    pub fn write(&mut self, cell: &Cell) -> Result<()> {
        let coerced;
        let cell = match (cell.type_of(), self.dtype) {
            (t, d) if t == d => cell,
            (CellType::Undefined, _) => cell,
            // numeric widening into float columns
            (CellType::Integer, CellType::Float) => {
                coerced = Cell::Float(cell.as_integer().unwrap() as f64);
                &coerced
            }
            (t, d) => {
                return Err(SfqError::TypeMismatch(format!(
                    "cannot store {t} cell in {d} column"
                )))
            }
        };
        write_cell(&mut self.writer, cell)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> Result<SegmentMeta> {
        self.writer.flush()?;
        Ok(SegmentMeta {
            file_name: self.file_name,
            rows: self.rows,
        })
    }
}

/// What a finished segment reports back to the column writer.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub file_name: String,
    pub rows: u64,
}

/// Multi-segment column writer.
///
/// Usage: open, `set_dtype`, detach one [`SegmentWriter`] per segment (they
/// may move to worker threads), then `close` with the finished segment
/// metadata in segment order. `close` commits the index atomically; nothing
/// is visible to readers before that.
pub struct ColumnWriter {
    dir: PathBuf,
    name: String,
    dtype: Option<CellType>,
    num_segments: usize,
    detached: Vec<bool>,
}

impl ColumnWriter {
    pub fn open(dir: &Path, name: &str, num_segments: usize) -> Result<Self> {
        if num_segments == 0 {
            return Err(SfqError::InvalidPlan(
                "column writer needs at least one segment".into(),
            ));
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            dtype: None,
            num_segments,
            detached: vec![false; num_segments],
        })
    }

    pub fn set_dtype(&mut self, dtype: CellType) {
        self.dtype = Some(dtype);
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn segment_writer(&mut self, segment: usize) -> Result<SegmentWriter> {
        let dtype = self.dtype.ok_or_else(|| {
            SfqError::Internal("column writer dtype must be set before writing".into())
        })?;
        if segment >= self.num_segments {
            return Err(SfqError::Internal(format!(
                "segment {segment} out of range ({} segments)",
                self.num_segments
            )));
        }
        if std::mem::replace(&mut self.detached[segment], true) {
            return Err(SfqError::Internal(format!(
                "segment {segment} writer detached twice"
            )));
        }
        let file_name = format!("{}_seg_{:04}.bin", self.name, segment);
        let file = File::create(self.dir.join(&file_name))?;
        Ok(SegmentWriter {
            writer: BufWriter::new(file),
            dtype,
            file_name,
            rows: 0,
        })
    }

    /// Commit the column. `segments` must be in segment order.
    pub fn close(self, segments: Vec<SegmentMeta>) -> Result<PathBuf> {
        let dtype = self
            .dtype
            .ok_or_else(|| SfqError::Internal("column writer closed without a dtype".into()))?;
        if segments.len() != self.num_segments {
            return Err(SfqError::Internal(format!(
                "column writer closed with {} of {} segments",
                segments.len(),
                self.num_segments
            )));
        }
        let index = ColumnIndex {
            version: COLUMN_INDEX_VERSION,
            dtype,
            segment_files: segments.iter().map(|m| m.file_name.clone()).collect(),
            segment_sizes: segments.iter().map(|m| m.rows).collect(),
            metadata: BTreeMap::new(),
        };
        let index_path = self.dir.join(format!("{}.sidx", self.name));
        write_column_index(&index_path, &index)?;
        Ok(index_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_two_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ColumnWriter::open(dir.path(), "col", 2).unwrap();
        w.set_dtype(CellType::Integer);

        let mut s0 = w.segment_writer(0).unwrap();
        let mut s1 = w.segment_writer(1).unwrap();
        for v in 0..3 {
            s0.write(&Cell::Integer(v)).unwrap();
        }
        for v in 3..5 {
            s1.write(&Cell::Integer(v)).unwrap();
        }
        let metas = vec![s0.finish().unwrap(), s1.finish().unwrap()];
        let index_path = w.close(metas).unwrap();

        let index = read_column_index(&index_path).unwrap();
        assert_eq!(index.dtype, CellType::Integer);
        assert_eq!(index.segment_sizes, vec![3, 2]);
        assert_eq!(index.total_rows(), 5);

        let mut all = Vec::new();
        for (file, rows) in index.segment_files.iter().zip(&index.segment_sizes) {
            let seg = SegmentReader::open(&dir.path().join(file), *rows).unwrap();
            for c in seg {
                all.push(c.unwrap());
            }
        }
        assert_eq!(all, (0..5).map(Cell::Integer).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_mistyped_cells() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ColumnWriter::open(dir.path(), "col", 1).unwrap();
        w.set_dtype(CellType::Integer);
        let mut s = w.segment_writer(0).unwrap();
        assert!(s.write(&Cell::String("nope".into())).is_err());
        // undefined is always in-band
        s.write(&Cell::Undefined).unwrap();
    }

    #[test]
    fn widens_integers_into_float_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ColumnWriter::open(dir.path(), "col", 1).unwrap();
        w.set_dtype(CellType::Float);
        let mut s = w.segment_writer(0).unwrap();
        s.write(&Cell::Integer(3)).unwrap();
        let meta = s.finish().unwrap();
        let index_path = w.close(vec![meta]).unwrap();
        let index = read_column_index(&index_path).unwrap();
        let seg = SegmentReader::open(
            &index_path.parent().unwrap().join(&index.segment_files[0]),
            1,
        )
        .unwrap();
        let cells: Vec<_> = seg.map(|c| c.unwrap()).collect();
        assert_eq!(cells, vec![Cell::Float(3.0)]);
    }
}
