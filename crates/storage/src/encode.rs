//! Cell payload codec for segment files.
//!
//! A segment file is a plain concatenation of bincode-encoded cells; the
//! row count lives in the column index, so the stream needs no terminator.

use std::io::{Read, Write};

use sfq_common::{Cell, Result, SfqError};

pub fn write_cell<W: Write>(w: &mut W, cell: &Cell) -> Result<()> {
    bincode::serialize_into(w, cell)
        .map_err(|e| SfqError::Storage(format!("cell encode failed: {e}")))
}

pub fn read_cell<R: Read>(r: &mut R) -> Result<Cell> {
    bincode::deserialize_from(r)
        .map_err(|e| SfqError::Storage(format!("cell decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfq_common::ImageBlob;

    #[test]
    fn round_trips_every_variant() {
        let cells = vec![
            Cell::Undefined,
            Cell::Integer(-42),
            Cell::Float(2.5),
            Cell::String("hello".into()),
            Cell::DateTime {
                posix: 1_400_000_000,
                microsecond: 250_000,
                tz_offset: Some(-20),
            },
            Cell::Image(ImageBlob {
                width: 2,
                height: 2,
                channels: 1,
                format: "raw".into(),
                data: vec![0, 1, 2, 3],
            }),
            Cell::Vector(vec![1.0, 2.0]),
            Cell::List(vec![Cell::Integer(1), Cell::String("x".into())]),
            Cell::Dict(vec![(Cell::String("k".into()), Cell::Integer(9))]),
        ];

        let mut buf = Vec::new();
        for c in &cells {
            write_cell(&mut buf, c).unwrap();
        }
        let mut r = buf.as_slice();
        for c in &cells {
            assert_eq!(&read_cell(&mut r).unwrap(), c);
        }
    }
}
