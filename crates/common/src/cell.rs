use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared type of a column or cell.
///
/// `Undefined` is both the type of an untyped empty column and the in-band
/// null that any typed column may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum CellType {
    Integer,
    Float,
    String,
    DateTime,
    Image,
    Vector,
    List,
    Dict,
    Undefined,
}

impl CellType {
    /// Stable rank used for cross-variant ordering.
    fn rank(self) -> u8 {
        match self {
            CellType::Undefined => 0,
            CellType::Integer => 1,
            CellType::Float => 2,
            CellType::String => 3,
            CellType::DateTime => 4,
            CellType::Image => 5,
            CellType::Vector => 6,
            CellType::List => 7,
            CellType::Dict => 8,
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CellType::Integer => "integer",
            CellType::Float => "float",
            CellType::String => "string",
            CellType::DateTime => "datetime",
            CellType::Image => "image",
            CellType::Vector => "vector",
            CellType::List => "list",
            CellType::Dict => "dict",
            CellType::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

/// A decoded image payload.
///
/// The engine never interprets the pixel data; it is an opaque blob plus the
/// dimensions callers need to do so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ImageBlob {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Encoding tag ("raw", "png", "jpeg", ...). Free-form.
    pub format: String,
    pub data: Vec<u8>,
}

/// A single table cell: the engine's universal value.
///
/// Scalars are stored inline; string/vector/list/dict/image payloads own
/// heap allocations. `Undefined` is the null: it compares equal only to
/// itself and sorts before every other variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Cell {
    Undefined,
    Integer(i64),
    Float(f64),
    String(String),
    /// Posix seconds + sub-second microseconds + optional timezone offset in
    /// quarter-hour units.
    DateTime {
        posix: i64,
        microsecond: u32,
        tz_offset: Option<i8>,
    },
    Image(ImageBlob),
    Vector(Vec<f64>),
    List(Vec<Cell>),
    Dict(Vec<(Cell, Cell)>),
}

impl Cell {
    /// The variant tag of this cell.
    pub fn type_of(&self) -> CellType {
        match self {
            Cell::Undefined => CellType::Undefined,
            Cell::Integer(_) => CellType::Integer,
            Cell::Float(_) => CellType::Float,
            Cell::String(_) => CellType::String,
            Cell::DateTime { .. } => CellType::DateTime,
            Cell::Image(_) => CellType::Image,
            Cell::Vector(_) => CellType::Vector,
            Cell::List(_) => CellType::List,
            Cell::Dict(_) => CellType::Dict,
        }
    }

    /// Is this the in-band null?
    pub fn is_undefined(&self) -> bool {
        matches!(self, Cell::Undefined)
    }

    /// The integer payload, if this is an integer cell.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Cell::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The numeric payload widened to float, for integer and float cells.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Cell::Float(v) => Some(*v),
            Cell::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The string payload, if this is a string cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }

    /// Mask truthiness: nonzero integers and floats select a row; everything
    /// else (including undefined) does not.
    pub fn is_truthy(&self) -> bool {
        match self {
            Cell::Integer(v) => *v != 0,
            Cell::Float(v) => *v != 0.0,
            _ => false,
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Undefined, Cell::Undefined) => true,
            (Cell::Integer(a), Cell::Integer(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => a == b,
            (Cell::Integer(a), Cell::Float(b)) | (Cell::Float(b), Cell::Integer(a)) => {
                (*a as f64) == *b
            }
            (Cell::String(a), Cell::String(b)) => a == b,
            (
                Cell::DateTime {
                    posix: p1,
                    microsecond: u1,
                    ..
                },
                Cell::DateTime {
                    posix: p2,
                    microsecond: u2,
                    ..
                },
            ) => p1 == p2 && u1 == u2,
            (Cell::Image(a), Cell::Image(b)) => a == b,
            (Cell::Vector(a), Cell::Vector(b)) => a == b,
            (Cell::List(a), Cell::List(b)) => a == b,
            (Cell::Dict(a), Cell::Dict(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Cell {
    /// Total cross-variant ordering: numerics compare numerically, otherwise
    /// type rank first, then value. Never returns `None`.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Cell {
    /// Total cross-variant comparison; the concrete order behind
    /// `partial_cmp`.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        use Cell::*;
        match (self, other) {
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (String(a), String(b)) => a.cmp(b),
            (
                DateTime {
                    posix: p1,
                    microsecond: u1,
                    ..
                },
                DateTime {
                    posix: p2,
                    microsecond: u2,
                    ..
                },
            ) => p1.cmp(p2).then(u1.cmp(u2)),
            (Vector(a), Vector(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.total_cmp(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (List(a), List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.total_cmp(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Dict(a), Dict(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let c = ka.total_cmp(kb).then_with(|| va.total_cmp(vb));
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Image(a), Image(b)) => a.data.cmp(&b.data),
            (a, b) => a.type_of().rank().cmp(&b.type_of().rank()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Undefined => f.write_str("None"),
            Cell::Integer(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::String(s) => write!(f, "{s:?}"),
            Cell::DateTime {
                posix, microsecond, ..
            } => write!(f, "datetime({posix}.{microsecond:06})"),
            Cell::Image(img) => write!(f, "image({}x{})", img.width, img.height),
            Cell::Vector(v) => write!(f, "array({:?})", v),
            Cell::List(v) => {
                f.write_str("[")?;
                for (i, c) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("]")
            }
            Cell::Dict(v) => {
                f.write_str("{")?;
                for (i, (k, val)) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {val}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Integer(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::String(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::String(v)
    }
}
