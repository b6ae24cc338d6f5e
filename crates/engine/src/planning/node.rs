//! Planner nodes: the logical operator DAG.
//!
//! A node is a kind plus two parameter maps (scalar cells and opaque
//! payloads) plus input edges. Nodes are shared by handle and treated as
//! immutable during planning; the two sanctioned in-place rewrites are the
//! partial materializer and the post-materialize source rewrite, both of
//! which replace a node's whole contents with a source over concrete data.
//! Input edges always point at previously constructed nodes, so cycles
//! cannot be formed.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use sfq_common::{Cell, CellType, Result, SfqError};
use sfq_storage::{SArray, SFrame};

use crate::execution::lambda::LambdaChannel;
use crate::execution::operators::reduce::ReduceFunction;
use crate::planning::registry::PlannerNodeType;

/// Row-mapping function used by `Transform` and generalized variants.
pub type RowMapFn = dyn Fn(&[Cell]) -> Result<Cell> + Send + Sync;
/// Pairwise row-mapping function used by `BinaryTransform`.
pub type BinaryMapFn = dyn Fn(&[Cell], &[Cell]) -> Result<Cell> + Send + Sync;
/// Multi-column row-mapping function used by `GeneralizedTransform`.
pub type MultiMapFn = dyn Fn(&[Cell]) -> Result<Vec<Cell>> + Send + Sync;

/// Payload of a `LambdaTransform` node.
#[derive(Clone)]
pub struct LambdaSpec {
    pub code: String,
    pub channel: Arc<dyn LambdaChannel>,
    pub skip_undefined: bool,
    pub seed: u64,
}

/// Non-scalar planner-node parameters.
///
/// A closed enum rather than `Any`: every payload an operator kind can carry
/// is named here, which keeps structural equality and plan reprs total.
#[derive(Clone)]
pub enum OpaqueParam {
    Column(SArray),
    Frame(SFrame),
    MapFn(Arc<RowMapFn>),
    BinaryMapFn(Arc<BinaryMapFn>),
    MultiMapFn(Arc<MultiMapFn>),
    Reducer(Arc<dyn ReduceFunction>),
    Lambda(LambdaSpec),
    /// Declared output cell types of a transform-like node.
    Types(Vec<CellType>),
    /// Output column position -> backing column that can be forwarded
    /// without re-reading (generalized union project pass-through).
    SourceMapping(BTreeMap<usize, SArray>),
}

impl PartialEq for OpaqueParam {
    fn eq(&self, other: &Self) -> bool {
        use OpaqueParam::*;
        match (self, other) {
            (Column(a), Column(b)) => a.ptr_eq(b),
            (Frame(a), Frame(b)) => a == b,
            (MapFn(a), MapFn(b)) => Arc::ptr_eq(a, b),
            (BinaryMapFn(a), BinaryMapFn(b)) => Arc::ptr_eq(a, b),
            (MultiMapFn(a), MultiMapFn(b)) => Arc::ptr_eq(a, b),
            (Reducer(a), Reducer(b)) => Arc::ptr_eq(a, b),
            (Lambda(a), Lambda(b)) => {
                a.code == b.code
                    && Arc::ptr_eq(&a.channel, &b.channel)
                    && a.skip_undefined == b.skip_undefined
                    && a.seed == b.seed
            }
            (Types(a), Types(b)) => a == b,
            (SourceMapping(a), SourceMapping(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.ptr_eq(vb))
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for OpaqueParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpaqueParam::Column(a) => write!(f, "column[{} x {}]", a.dtype(), a.len()),
            OpaqueParam::Frame(s) => write!(f, "frame[{} x {}]", s.num_columns(), s.num_rows()),
            OpaqueParam::MapFn(_) => f.write_str("fn"),
            OpaqueParam::BinaryMapFn(_) => f.write_str("fn2"),
            OpaqueParam::MultiMapFn(_) => f.write_str("fnN"),
            OpaqueParam::Reducer(r) => write!(f, "reducer({})", r.name()),
            OpaqueParam::Lambda(l) => write!(f, "lambda({} bytes)", l.code.len()),
            OpaqueParam::Types(t) => write!(f, "{t:?}"),
            OpaqueParam::SourceMapping(m) => write!(f, "passthrough{:?}", m.keys()),
        }
    }
}

/// A node in the logical operator DAG.
#[derive(Clone)]
pub struct PlannerNode {
    pub kind: PlannerNodeType,
    pub scalars: BTreeMap<String, Cell>,
    pub opaques: BTreeMap<String, OpaqueParam>,
    pub inputs: Vec<NodeRef>,
}

/// Shared handle to a planner node.
pub type NodeRef = Arc<RwLock<PlannerNode>>;

/// Stable identity key of a node handle, for memo tables.
pub fn node_key(node: &NodeRef) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

impl PlannerNode {
    pub fn new(kind: PlannerNodeType) -> Self {
        Self {
            kind,
            scalars: BTreeMap::new(),
            opaques: BTreeMap::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_scalar(mut self, key: &str, value: impl Into<Cell>) -> Self {
        self.scalars.insert(key.to_string(), value.into());
        self
    }

    pub fn with_opaque(mut self, key: &str, value: OpaqueParam) -> Self {
        self.opaques.insert(key.to_string(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<NodeRef>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn into_ref(self) -> NodeRef {
        Arc::new(RwLock::new(self))
    }

    pub fn scalar(&self, key: &str) -> Result<&Cell> {
        self.scalars.get(key).ok_or_else(|| {
            SfqError::Internal(format!("{} node missing scalar param {key}", self.kind.name()))
        })
    }

    pub fn scalar_i64(&self, key: &str) -> Result<i64> {
        self.scalar(key)?.as_integer().ok_or_else(|| {
            SfqError::Internal(format!(
                "{} node param {key} is not an integer",
                self.kind.name()
            ))
        })
    }

    pub fn scalar_u64(&self, key: &str) -> Result<u64> {
        let v = self.scalar_i64(key)?;
        u64::try_from(v).map_err(|_| {
            SfqError::Internal(format!("{} node param {key} is negative", self.kind.name()))
        })
    }

    /// Decode a `Cell::List` of integers (e.g. projection indices).
    pub fn scalar_index_list(&self, key: &str) -> Result<Vec<usize>> {
        match self.scalar(key)? {
            Cell::List(items) => items
                .iter()
                .map(|c| {
                    c.as_integer()
                        .and_then(|v| usize::try_from(v).ok())
                        .ok_or_else(|| {
                            SfqError::Internal(format!(
                                "{} node param {key} holds a non-index entry",
                                self.kind.name()
                            ))
                        })
                })
                .collect(),
            _ => Err(SfqError::Internal(format!(
                "{} node param {key} is not a list",
                self.kind.name()
            ))),
        }
    }

    pub fn opaque(&self, key: &str) -> Result<&OpaqueParam> {
        self.opaques.get(key).ok_or_else(|| {
            SfqError::Internal(format!("{} node missing opaque param {key}", self.kind.name()))
        })
    }

    pub fn frame(&self, key: &str) -> Result<&SFrame> {
        match self.opaque(key)? {
            OpaqueParam::Frame(f) => Ok(f),
            _ => Err(SfqError::Internal(format!(
                "{} node param {key} is not a frame",
                self.kind.name()
            ))),
        }
    }

    pub fn column(&self, key: &str) -> Result<&SArray> {
        match self.opaque(key)? {
            OpaqueParam::Column(c) => Ok(c),
            _ => Err(SfqError::Internal(format!(
                "{} node param {key} is not a column",
                self.kind.name()
            ))),
        }
    }

    pub fn types(&self, key: &str) -> Result<&[CellType]> {
        match self.opaque(key)? {
            OpaqueParam::Types(t) => Ok(t),
            _ => Err(SfqError::Internal(format!(
                "{} node param {key} is not a type list",
                self.kind.name()
            ))),
        }
    }

    /// Structural identity: same kind, same parameters, same input handles.
    pub fn structurally_eq(&self, other: &PlannerNode) -> bool {
        self.kind == other.kind
            && self.scalars == other.scalars
            && self.opaques == other.opaques
            && self.inputs.len() == other.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&other.inputs)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

/// Overwrite a shared node in place.
///
/// Every handle to `node` (user handles included) observes the new contents;
/// this is how a materialized plan tip becomes a cheap source for later
/// queries.
pub fn replace_contents(node: &NodeRef, new_contents: PlannerNode) {
    *node.write().expect("planner node lock poisoned") = new_contents;
}

/// Read accessor shorthand.
pub fn read_node(node: &NodeRef) -> std::sync::RwLockReadGuard<'_, PlannerNode> {
    node.read().expect("planner node lock poisoned")
}

/// Render a plan as an indented tree, for logs and tests.
pub fn node_repr(node: &NodeRef) -> String {
    let mut out = String::new();
    fmt_node(node, 0, &mut out);
    out
}

fn fmt_node(node: &NodeRef, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let n = read_node(node);
    let _ = write!(out, "{pad}{}", n.kind.name());
    if !n.scalars.is_empty() {
        let _ = write!(out, " {{");
        for (i, (k, v)) in n.scalars.iter().enumerate() {
            if i > 0 {
                let _ = write!(out, ", ");
            }
            let _ = write!(out, "{k}={v}");
        }
        let _ = write!(out, "}}");
    }
    for (k, v) in &n.opaques {
        let _ = write!(out, " {k}={v:?}");
    }
    out.push('\n');
    for input in &n.inputs {
        fmt_node(input, indent + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_tracks_all_fields() {
        let a = PlannerNode::new(PlannerNodeType::Range)
            .with_scalar("begin_index", 0i64)
            .with_scalar("end_index", 5i64)
            .into_ref();
        let b = PlannerNode::new(PlannerNodeType::Range)
            .with_scalar("begin_index", 0i64)
            .with_scalar("end_index", 5i64);
        assert!(read_node(&a).structurally_eq(&b));

        let c = b.clone().with_scalar("end_index", 6i64);
        assert!(!read_node(&a).structurally_eq(&c));
    }

    #[test]
    fn replace_contents_is_visible_through_all_handles() {
        let node = PlannerNode::new(PlannerNodeType::Identity).into_ref();
        let alias = node.clone();
        replace_contents(
            &node,
            PlannerNode::new(PlannerNodeType::Range)
                .with_scalar("begin_index", 0i64)
                .with_scalar("end_index", 1i64),
        );
        assert_eq!(read_node(&alias).kind, PlannerNodeType::Range);
    }
}
