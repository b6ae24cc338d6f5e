//! Immutable materialized column handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sfq_common::{Cell, CellType, Result, SfqError};
use tempfile::TempDir;

use crate::column::{read_column_index, ColumnIndex, ColumnWriter, SegmentReader};

struct SArrayInner {
    index: ColumnIndex,
    /// Directory holding the segment files.
    dir: PathBuf,
    index_path: PathBuf,
    /// Keeps temp-backed columns alive for as long as any handle exists.
    /// Shared when several columns live in one scratch directory.
    _scratch: Option<Arc<TempDir>>,
}

/// A single typed, immutable, segmented column.
///
/// Cheap to clone; clones share the backing files. Equality is handle
/// identity (two handles are equal when they share a backing store), which
/// is what plan memoization and the pass-through fast path need.
#[derive(Clone)]
pub struct SArray {
    inner: Arc<SArrayInner>,
}

impl SArray {
    /// Open an existing column by its index file.
    pub fn open(index_path: &Path) -> Result<Self> {
        let index = read_column_index(index_path)?;
        let dir = index_path
            .parent()
            .ok_or_else(|| {
                SfqError::Storage(format!("column index {} has no parent", index_path.display()))
            })?
            .to_path_buf();
        Ok(Self {
            inner: Arc::new(SArrayInner {
                index,
                dir,
                index_path: index_path.to_path_buf(),
                _scratch: None,
            }),
        })
    }

    pub(crate) fn from_parts(
        index: ColumnIndex,
        index_path: PathBuf,
        scratch: Option<Arc<TempDir>>,
    ) -> Self {
        let dir = index_path.parent().expect("index path has parent").to_path_buf();
        Self {
            inner: Arc::new(SArrayInner {
                index,
                dir,
                index_path,
                _scratch: scratch,
            }),
        }
    }

    /// Write cells through a scratch-directory column and return the handle.
    pub fn from_cells<I>(cells: I, dtype: CellType, num_segments: usize) -> Result<Self>
    where
        I: IntoIterator<Item = Cell>,
    {
        let cells: Vec<Cell> = cells.into_iter().collect();
        let num_segments = num_segments.max(1);
        let scratch = Arc::new(
            tempfile::Builder::new()
                .prefix("sfq-column-")
                .tempdir()?,
        );
        let mut writer = ColumnWriter::open(scratch.path(), "col_0", num_segments)?;
        writer.set_dtype(dtype);

        // even split, remainder spread over the leading segments
        let n = cells.len();
        let base = n / num_segments;
        let extra = n % num_segments;
        let mut metas = Vec::with_capacity(num_segments);
        let mut it = cells.into_iter();
        for s in 0..num_segments {
            let take = base + usize::from(s < extra);
            let mut seg = writer.segment_writer(s)?;
            for cell in it.by_ref().take(take) {
                seg.write(&cell)?;
            }
            metas.push(seg.finish()?);
        }
        let index_path = writer.close(metas)?;
        let index = read_column_index(&index_path)?;
        Ok(Self::from_parts(index, index_path, Some(scratch)))
    }

    pub fn len(&self) -> u64 {
        self.inner.index.total_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> CellType {
        self.inner.index.dtype
    }

    pub fn num_segments(&self) -> usize {
        self.inner.index.num_segments()
    }

    pub fn segment_size(&self, segment: usize) -> u64 {
        self.inner.index.segment_sizes[segment]
    }

    pub fn index_path(&self) -> &Path {
        &self.inner.index_path
    }

    pub(crate) fn index(&self) -> &ColumnIndex {
        &self.inner.index
    }

    /// True when both handles share one backing store.
    pub fn ptr_eq(&self, other: &SArray) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Typed cell iterator over one segment.
    pub fn segment_iter(&self, segment: usize) -> Result<SegmentReader> {
        let index = &self.inner.index;
        if segment >= index.num_segments() {
            return Err(SfqError::Internal(format!(
                "segment {segment} out of range ({} segments)",
                index.num_segments()
            )));
        }
        SegmentReader::open(
            &self.inner.dir.join(&index.segment_files[segment]),
            index.segment_sizes[segment],
        )
    }

    /// Iterate rows `[begin, end)` across segment boundaries.
    pub fn range_iter(&self, begin: u64, end: u64) -> Result<RangeReader> {
        let len = self.len();
        if begin > end || end > len {
            return Err(SfqError::InvalidPlan(format!(
                "row range [{begin}, {end}) out of bounds for column of {len} rows"
            )));
        }
        Ok(RangeReader {
            array: self.clone(),
            segment: 0,
            current: None,
            to_skip: begin,
            remaining: end - begin,
        })
    }

    /// Read the whole column into memory. Test and small-data convenience.
    pub fn to_vec(&self) -> Result<Vec<Cell>> {
        self.range_iter(0, self.len())?.collect()
    }
}

impl PartialEq for SArray {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl std::fmt::Debug for SArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SArray")
            .field("dtype", &self.dtype())
            .field("len", &self.len())
            .field("segments", &self.num_segments())
            .finish()
    }
}

/// Cross-segment row-range iterator over a column.
pub struct RangeReader {
    array: SArray,
    segment: usize,
    current: Option<SegmentReader>,
    to_skip: u64,
    remaining: u64,
}

impl Iterator for RangeReader {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            if self.current.is_none() {
                if self.segment >= self.array.num_segments() {
                    return Some(Err(SfqError::Storage(
                        "column shorter than its index claims".into(),
                    )));
                }
                // skip whole segments while the start lies beyond them
                let seg_rows = self.array.segment_size(self.segment);
                if self.to_skip >= seg_rows {
                    self.to_skip -= seg_rows;
                    self.segment += 1;
                    continue;
                }
                match self.array.segment_iter(self.segment) {
                    Ok(r) => self.current = Some(r),
                    Err(e) => return Some(Err(e)),
                }
            }
            let reader = self.current.as_mut().expect("reader present");
            match reader.next() {
                Some(Ok(cell)) => {
                    if self.to_skip > 0 {
                        self.to_skip -= 1;
                        continue;
                    }
                    self.remaining -= 1;
                    return Some(Ok(cell));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.current = None;
                    self.segment += 1;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: impl IntoIterator<Item = i64>) -> Vec<Cell> {
        v.into_iter().map(Cell::Integer).collect()
    }

    #[test]
    fn from_cells_round_trip() {
        let sa = SArray::from_cells(ints(0..10), CellType::Integer, 3).unwrap();
        assert_eq!(sa.len(), 10);
        assert_eq!(sa.num_segments(), 3);
        assert_eq!(sa.to_vec().unwrap(), ints(0..10));
    }

    #[test]
    fn range_iter_spans_segments() {
        let sa = SArray::from_cells(ints(0..10), CellType::Integer, 4).unwrap();
        let got: Vec<Cell> = sa.range_iter(2, 9).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(got, ints(2..9));
    }

    #[test]
    fn empty_range() {
        let sa = SArray::from_cells(ints(0..4), CellType::Integer, 2).unwrap();
        let got: Vec<Cell> = sa.range_iter(3, 3).unwrap().map(|c| c.unwrap()).collect();
        assert!(got.is_empty());
    }

    #[test]
    fn handle_equality_is_identity() {
        let a = SArray::from_cells(ints(0..3), CellType::Integer, 1).unwrap();
        let b = SArray::from_cells(ints(0..3), CellType::Integer, 1).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
