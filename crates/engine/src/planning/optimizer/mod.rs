//! The rule-driven plan rewriter.
//!
//! Rewrites run over an arena copy of the DAG where every node knows both
//! its inputs and its consumers. A work queue starts with every node; for
//! each popped node the applicable rules are tried in registration order,
//! and a successful rewrite re-enqueues the node and its neighbors. When
//! the queue drains, the arena is folded back into planner nodes with
//! sharing preserved.
//!
//! Every rule either removes a node or pushes a filter strictly closer to
//! the sources, so the queue drains after a bounded number of rewrites; a
//! hard cap turns a violation of that argument into an error instead of a
//! hang.

pub mod rules;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use sfq_common::{Cell, Result, SfqError};

use crate::planning::node::{node_key, read_node, NodeRef, OpaqueParam, PlannerNode};
use crate::planning::planner::MaterializeOptions;
use crate::planning::registry::PlannerNodeType;

/// Rewrites allowed per original node before the engine declares a bug.
const REWRITE_CAP_FACTOR: usize = 64;

/// One arena node: planner-node payload plus consumer edges.
pub struct OptNode {
    pub kind: PlannerNodeType,
    pub scalars: BTreeMap<String, Cell>,
    pub opaques: BTreeMap<String, OpaqueParam>,
    pub inputs: Vec<usize>,
    /// Consumer ids; a node consuming this twice appears twice.
    pub outputs: Vec<usize>,
}

/// A plan rewrite rule.
pub trait OptRule {
    /// Logged when the rule fires.
    fn description(&self) -> &'static str;

    fn applies_to(&self, kind: PlannerNodeType) -> bool;

    /// Try to rewrite around `node`; `true` means the graph changed.
    fn apply(&self, eng: &mut OptEngine, node: usize) -> Result<bool>;
}

/// The arena the rules rewrite.
pub struct OptEngine {
    nodes: Vec<OptNode>,
    tip: usize,
    rewrites: usize,
    rewrite_cap: usize,
}

impl OptEngine {
    fn from_plan(tip: &NodeRef) -> Self {
        let mut memo = HashMap::new();
        let mut nodes = Vec::new();
        let tip_id = intern(tip, &mut memo, &mut nodes);
        let cap = REWRITE_CAP_FACTOR * nodes.len().max(1);
        Self {
            nodes,
            tip: tip_id,
            rewrites: 0,
            rewrite_cap: cap,
        }
    }

    pub fn tip(&self) -> usize {
        self.tip
    }

    pub fn node(&self, id: usize) -> &OptNode {
        &self.nodes[id]
    }

    /// Consumer count, duplicates included.
    pub fn num_consumers(&self, id: usize) -> usize {
        self.nodes[id].outputs.len() + usize::from(id == self.tip)
    }

    /// Add a fresh node wired to its inputs.
    pub fn add_node(
        &mut self,
        kind: PlannerNodeType,
        scalars: BTreeMap<String, Cell>,
        opaques: BTreeMap<String, OpaqueParam>,
        inputs: Vec<usize>,
    ) -> usize {
        let id = self.nodes.len();
        for &i in &inputs {
            self.nodes[i].outputs.push(id);
        }
        self.nodes.push(OptNode {
            kind,
            scalars,
            opaques,
            inputs,
            outputs: Vec::new(),
        });
        id
    }

    /// Swap a node's payload, keeping its identity and consumers.
    pub fn set_node(
        &mut self,
        id: usize,
        kind: PlannerNodeType,
        scalars: BTreeMap<String, Cell>,
        opaques: BTreeMap<String, OpaqueParam>,
    ) {
        let n = &mut self.nodes[id];
        n.kind = kind;
        n.scalars = scalars;
        n.opaques = opaques;
    }

    /// Rewire a node's inputs, maintaining consumer edges both ways.
    pub fn set_inputs(&mut self, id: usize, inputs: Vec<usize>) {
        let old = std::mem::take(&mut self.nodes[id].inputs);
        for &i in &old {
            remove_one(&mut self.nodes[i].outputs, id);
        }
        for &i in &inputs {
            self.nodes[i].outputs.push(id);
        }
        self.nodes[id].inputs = inputs;
        for i in old {
            self.collect_garbage(i);
        }
        self.collect_garbage(id);
    }

    /// Point every consumer of `old` (and the tip, if it is `old`) at
    /// `new`, then detach `old` from the graph.
    pub fn replace_with(&mut self, old: usize, new: usize) {
        let consumers = std::mem::take(&mut self.nodes[old].outputs);
        for c in consumers {
            for slot in &mut self.nodes[c].inputs {
                if *slot == old {
                    *slot = new;
                }
            }
            self.nodes[new].outputs.push(c);
        }
        if self.tip == old {
            self.tip = new;
        }
        self.set_inputs(old, Vec::new());
    }

    /// Drop nodes that lost their last consumer, releasing their input
    /// edges recursively so consumer counts stay truthful.
    fn collect_garbage(&mut self, candidate: usize) {
        let mut stack = vec![candidate];
        while let Some(id) = stack.pop() {
            if id == self.tip || !self.nodes[id].outputs.is_empty() {
                continue;
            }
            let inputs = std::mem::take(&mut self.nodes[id].inputs);
            for i in inputs {
                remove_one(&mut self.nodes[i].outputs, id);
                stack.push(i);
            }
        }
    }

    /// Column count of an arena node's output.
    pub fn num_columns(&self, id: usize) -> Result<usize> {
        let n = &self.nodes[id];
        Ok(match n.kind {
            PlannerNodeType::Constant | PlannerNodeType::Range | PlannerNodeType::SArraySource => {
                1
            }
            PlannerNodeType::SFrameSource => frame_param(n)?.num_columns(),
            PlannerNodeType::Transform
            | PlannerNodeType::BinaryTransform
            | PlannerNodeType::LambdaTransform
            | PlannerNodeType::Reduce => 1,
            PlannerNodeType::GeneralizedTransform => match n.opaques.get("output_types") {
                Some(OpaqueParam::Types(t)) => t.len(),
                _ => {
                    return Err(SfqError::Internal(
                        "generalized transform node without output types".into(),
                    ))
                }
            },
            PlannerNodeType::Project | PlannerNodeType::GeneralizedUnionProject => {
                index_list_param(n)?.len()
            }
            PlannerNodeType::Union => {
                let mut total = 0;
                for &i in &n.inputs {
                    total += self.num_columns(i)?;
                }
                total
            }
            PlannerNodeType::Append
            | PlannerNodeType::LogicalFilter
            | PlannerNodeType::Identity => self.num_columns(n.inputs[0])?,
        })
    }

    fn neighbors(&self, id: usize) -> Vec<usize> {
        let n = &self.nodes[id];
        let mut v = n.inputs.clone();
        v.extend(n.outputs.iter().copied());
        v
    }

    fn live_set(&self) -> HashSet<usize> {
        let mut live = HashSet::new();
        let mut stack = vec![self.tip];
        while let Some(id) = stack.pop() {
            if live.insert(id) {
                stack.extend(self.nodes[id].inputs.iter().copied());
            }
        }
        live
    }

    fn run_stage(&mut self, registry: &rules::RuleRegistry, stage: usize) -> Result<()> {
        let live = self.live_set();
        let mut queue: VecDeque<usize> = live.iter().copied().collect();
        let mut queued: HashSet<usize> = live;
        while let Some(id) = queue.pop_front() {
            queued.remove(&id);
            // rewrites may have orphaned this entry
            if self.nodes[id].outputs.is_empty() && id != self.tip {
                continue;
            }
            let kind = self.nodes[id].kind;
            for rule in registry.stage_rules(stage) {
                if !rule.applies_to(kind) {
                    continue;
                }
                if rule.apply(self, id)? {
                    self.rewrites += 1;
                    tracing::debug!(rule = rule.description(), "plan rewrite applied");
                    if self.rewrites > self.rewrite_cap {
                        return Err(SfqError::Internal(format!(
                            "optimizer exceeded {} rewrites; a rule is not reducing the plan",
                            self.rewrite_cap
                        )));
                    }
                    for n in self.neighbors(id).into_iter().chain([id]) {
                        if queued.insert(n) {
                            queue.push_back(n);
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn rebuild(&self) -> NodeRef {
        let mut memo = HashMap::new();
        self.rebuild_node(self.tip, &mut memo)
    }

    fn rebuild_node(&self, id: usize, memo: &mut HashMap<usize, NodeRef>) -> NodeRef {
        if let Some(n) = memo.get(&id) {
            return n.clone();
        }
        let n = &self.nodes[id];
        let inputs = n
            .inputs
            .iter()
            .map(|&i| self.rebuild_node(i, memo))
            .collect();
        let node = PlannerNode {
            kind: n.kind,
            scalars: n.scalars.clone(),
            opaques: n.opaques.clone(),
            inputs,
        }
        .into_ref();
        memo.insert(id, node.clone());
        node
    }
}

fn intern(
    node: &NodeRef,
    memo: &mut HashMap<usize, usize>,
    nodes: &mut Vec<OptNode>,
) -> usize {
    let key = node_key(node);
    if let Some(&id) = memo.get(&key) {
        return id;
    }
    let contents = read_node(node).clone();
    let inputs: Vec<usize> = contents
        .inputs
        .iter()
        .map(|i| intern(i, memo, nodes))
        .collect();
    let id = nodes.len();
    for &i in &inputs {
        nodes[i].outputs.push(id);
    }
    nodes.push(OptNode {
        kind: contents.kind,
        scalars: contents.scalars,
        opaques: contents.opaques,
        inputs,
        outputs: Vec::new(),
    });
    memo.insert(key, id);
    id
}

fn remove_one(v: &mut Vec<usize>, value: usize) {
    if let Some(pos) = v.iter().position(|&x| x == value) {
        v.swap_remove(pos);
    }
}

pub(crate) fn frame_param(n: &OptNode) -> Result<&sfq_storage::SFrame> {
    match n.opaques.get("frame") {
        Some(OpaqueParam::Frame(f)) => Ok(f),
        _ => Err(SfqError::Internal(
            "frame source node carries no frame".into(),
        )),
    }
}

pub(crate) fn column_param(n: &OptNode) -> Result<&sfq_storage::SArray> {
    match n.opaques.get("column") {
        Some(OpaqueParam::Column(c)) => Ok(c),
        _ => Err(SfqError::Internal(
            "column source node carries no column".into(),
        )),
    }
}

pub(crate) fn index_list_param(n: &OptNode) -> Result<Vec<usize>> {
    match n.scalars.get("indices") {
        Some(Cell::List(items)) => items
            .iter()
            .map(|c| {
                c.as_integer()
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or_else(|| SfqError::Internal("non-index projection entry".into()))
            })
            .collect(),
        _ => Err(SfqError::Internal("node carries no index list".into())),
    }
}

pub(crate) fn scalar_u64_param(n: &OptNode, key: &str) -> Result<u64> {
    n.scalars
        .get(key)
        .and_then(Cell::as_integer)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| SfqError::Internal(format!("node missing integer param {key}")))
}

/// Run the registered rewrite stages over a plan and return the rewritten
/// tip. The input plan is left untouched; sharing inside the plan survives.
pub fn optimize_planner_graph(tip: &NodeRef, options: &MaterializeOptions) -> Result<NodeRef> {
    let mut eng = OptEngine::from_plan(tip);
    let registry = rules::default_rules();
    let stages = if options.first_pass_only { 1 } else { registry.num_stages() };
    for stage in 0..stages {
        eng.run_stage(&registry, stage)?;
    }
    Ok(eng.rebuild())
}
