//! The columnar block of rows operators exchange.

use sfq_common::{Cell, Result, SfqError};

/// A block of rows stored column-wise: N equal-length cell vectors.
///
/// Every block exchanged during one query carries exactly the configured
/// row count, except the terminal block which may be shorter. Blocks are
/// refilled in place (`clear` keeps the allocation).
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    columns: Vec<Vec<Cell>>,
}

impl RowBatch {
    pub fn new(num_columns: usize, capacity: usize) -> Self {
        Self {
            columns: (0..num_columns)
                .map(|_| Vec::with_capacity(capacity))
                .collect(),
        }
    }

    pub fn from_columns(columns: Vec<Vec<Cell>>) -> Result<Self> {
        if let Some(first) = columns.first() {
            for c in &columns {
                if c.len() != first.len() {
                    return Err(SfqError::Internal(format!(
                        "ragged block: column of {} rows next to {}",
                        c.len(),
                        first.len()
                    )));
                }
            }
        }
        Ok(Self { columns })
    }

    /// A block with the given shape filled with undefined cells. Stands in
    /// for data a consumer asked to skip: the row count is right, the
    /// payload is not.
    pub fn placeholder(num_columns: usize, num_rows: usize) -> Self {
        Self {
            columns: (0..num_columns)
                .map(|_| vec![Cell::Undefined; num_rows])
                .collect(),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn push_row(&mut self, row: &[Cell]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SfqError::Internal(format!(
                "row of {} cells pushed into {}-column block",
                row.len(),
                self.columns.len()
            )));
        }
        for (col, cell) in self.columns.iter_mut().zip(row) {
            col.push(cell.clone());
        }
        Ok(())
    }

    /// Drop all rows, keeping column count and allocations.
    pub fn clear(&mut self) {
        for c in &mut self.columns {
            c.clear();
        }
    }

    pub fn column(&self, idx: usize) -> &[Cell] {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[Vec<Cell>] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Vec<Cell>> {
        self.columns
    }

    pub fn row(&self, idx: usize) -> RowRef<'_> {
        RowRef { batch: self, idx }
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        (0..self.num_rows()).map(move |idx| RowRef { batch: self, idx })
    }
}

/// A single row of a block, viewed across its columns.
#[derive(Clone, Copy)]
pub struct RowRef<'a> {
    batch: &'a RowBatch,
    idx: usize,
}

impl<'a> RowRef<'a> {
    pub fn cell(&self, column: usize) -> &'a Cell {
        &self.batch.columns[column][self.idx]
    }

    pub fn len(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<Cell> {
        (0..self.len()).map(|c| self.cell(c).clone()).collect()
    }
}

/// Row accumulator for operators that cannot emit one block per input block
/// (filters, appends): rows collect here until a full block can be cut.
#[derive(Debug)]
pub struct RowBuffer {
    columns: Vec<Vec<Cell>>,
    target: usize,
}

impl RowBuffer {
    pub fn new(num_columns: usize, target: usize) -> Self {
        Self {
            columns: (0..num_columns).map(|_| Vec::new()).collect(),
            target,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_full_block(&self) -> bool {
        self.len() >= self.target
    }

    pub fn push_row(&mut self, row: RowRef<'_>) {
        for (c, col) in self.columns.iter_mut().enumerate() {
            col.push(row.cell(c).clone());
        }
    }

    pub fn push_cells(&mut self, row: &[Cell]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SfqError::Internal(format!(
                "row of {} cells buffered into {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (col, cell) in self.columns.iter_mut().zip(row) {
            col.push(cell.clone());
        }
        Ok(())
    }

    /// Cut one full block off the front, if available.
    pub fn take_full_block(&mut self) -> Option<RowBatch> {
        if !self.has_full_block() {
            return None;
        }
        let mut out = Vec::with_capacity(self.columns.len());
        for col in &mut self.columns {
            let rest = col.split_off(self.target);
            out.push(std::mem::replace(col, rest));
        }
        Some(RowBatch { columns: out })
    }

    /// Take whatever remains (the terminal, possibly short, block).
    pub fn take_rest(&mut self) -> Option<RowBatch> {
        if self.is_empty() {
            return None;
        }
        let columns = self.columns.iter_mut().map(std::mem::take).collect();
        Some(RowBatch { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_iterate_rows() {
        let mut b = RowBatch::new(2, 4);
        b.push_row(&[Cell::Integer(1), Cell::String("a".into())]).unwrap();
        b.push_row(&[Cell::Integer(2), Cell::String("b".into())]).unwrap();
        assert_eq!(b.num_rows(), 2);
        let rows: Vec<Vec<Cell>> = b.rows().map(|r| r.to_vec()).collect();
        assert_eq!(rows[1], vec![Cell::Integer(2), Cell::String("b".into())]);
        b.clear();
        assert_eq!(b.num_rows(), 0);
        assert_eq!(b.num_columns(), 2);
    }

    #[test]
    fn ragged_blocks_are_rejected() {
        assert!(RowBatch::from_columns(vec![vec![Cell::Integer(1)], vec![]]).is_err());
    }

    #[test]
    fn buffer_cuts_fixed_blocks() {
        let mut buf = RowBuffer::new(1, 3);
        for v in 0..7 {
            buf.push_cells(&[Cell::Integer(v)]).unwrap();
        }
        let a = buf.take_full_block().unwrap();
        assert_eq!(a.num_rows(), 3);
        assert_eq!(a.column(0)[0], Cell::Integer(0));
        let b = buf.take_full_block().unwrap();
        assert_eq!(b.column(0)[0], Cell::Integer(3));
        assert!(buf.take_full_block().is_none());
        let rest = buf.take_rest().unwrap();
        assert_eq!(rest.num_rows(), 1);
        assert_eq!(rest.column(0)[0], Cell::Integer(6));
        assert!(buf.take_rest().is_none());
    }

    #[test]
    fn placeholder_has_shape_but_no_data() {
        let p = RowBatch::placeholder(3, 5);
        assert_eq!(p.num_rows(), 5);
        assert!(p.column(2).iter().all(|c| c.is_undefined()));
    }
}
