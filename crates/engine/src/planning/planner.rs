//! The public materialization entry point.
//!
//! Everything a caller materializes flows through [`Planner::materialize`]:
//! optimize, take the cheap exits for plans that are already concrete,
//! partially materialize whatever cannot run as one rate-coupled linear
//! region, then stream the remaining tip through the subplan executor. On
//! success (and with no callback sink) the caller's tip is rewritten in
//! place into a source over the result, so re-querying it is free.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sfq_common::{EngineConfig, QueryRuntime, Result, SfqError};
use sfq_storage::{SArray, SFrame};

use crate::execution::executor::{run_reduce, run_to_callback, run_to_frame, WriteCallback};
use crate::execution::operators::project::make_project_node;
use crate::execution::operators::reduce::reducer_param;
use crate::planning::infer::{infer_num_columns, infer_num_dependency_nodes};
use crate::planning::node::{
    node_key, read_node, replace_contents, node_repr, NodeRef, OpaqueParam, PlannerNode,
};
use crate::planning::optimizer::optimize_planner_graph;
use crate::planning::registry::{
    consumes_inputs_at_same_rate, is_linear_transform, is_parallel_slicable, is_source_node,
    is_sublinear_transform, parallel_slicable_codes, PlannerNodeType,
};
use crate::planning::segment::make_segmented_graph;

/// Knobs for one materialization.
#[derive(Clone)]
pub struct MaterializeOptions {
    /// Parallel segments to produce; 0 means the CPU count.
    pub num_segments: usize,
    /// Skip the rule-driven rewriter entirely.
    pub disable_optimization: bool,
    /// Materialize non-linear regions before execution. Turning this off
    /// fails any plan that is not already one linear region.
    pub partial_materialize: bool,
    /// Run only the always-on rewrite stage (used while plans are still
    /// being composed).
    pub first_pass_only: bool,
    /// Materialize every non-source input eagerly instead of the
    /// slicing-code analysis. Slower; used to cross-check the analysis.
    pub naive_mode: bool,
    /// Persist the result as a directory archive here.
    pub output_path: Option<PathBuf>,
    /// Rename the output columns; must match the output column count.
    pub output_column_names: Vec<String>,
    /// Stream blocks to this sink instead of building a frame.
    pub write_callback: Option<WriteCallback>,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            num_segments: 0,
            disable_optimization: false,
            partial_materialize: true,
            first_pass_only: false,
            naive_mode: false,
            output_path: None,
            output_column_names: Vec::new(),
            write_callback: None,
        }
    }
}

impl MaterializeOptions {
    /// Options for the planner's own nested materializations: same
    /// analysis knobs, no caller-facing output options.
    fn for_recursion(&self, default_segments: usize) -> Self {
        Self {
            num_segments: default_segments,
            output_path: None,
            output_column_names: Vec::new(),
            write_callback: None,
            ..self.clone()
        }
    }
}

/// The materialization driver.
pub struct Planner {
    runtime: Arc<QueryRuntime>,
    config: EngineConfig,
}

impl Planner {
    pub fn new(runtime: Arc<QueryRuntime>, config: EngineConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Materialize the plan under `tip`.
    ///
    /// Holds the process-wide query lock for the duration; nested
    /// materializations run inside it. With no callback sink, `tip` is
    /// rewritten in place to a source over the returned frame.
    pub fn materialize(&self, tip: &NodeRef, mut opts: MaterializeOptions) -> Result<SFrame> {
        let _guard = self.runtime.lock_queries();
        if opts.num_segments == 0 {
            opts.num_segments = self.runtime.default_num_segments();
        }
        if !is_source_node(tip) {
            tracing::debug!(plan = %node_repr(tip), "materializing");
        }
        let mut ptip = tip.clone();
        if !opts.disable_optimization {
            ptip = optimize_planner_graph(&ptip, &opts)?;
            if !is_source_node(&ptip) {
                tracing::debug!(plan = %node_repr(&ptip), "optimized as");
            }
        }

        if opts.partial_materialize {
            let rec = opts.for_recursion(self.runtime.default_num_segments());
            if opts.naive_mode {
                self.naive_partial_materialize(&ptip, &rec)?;
            } else {
                let mut memo = HashMap::new();
                self.partial_materialize_impl(&ptip, &rec, &mut memo)?;
            }
        }
        let final_node = ptip;

        if opts.write_callback.is_none() {
            let frame = self.execute_node(&final_node, &opts)?;
            replace_contents(tip, sframe_source_contents(frame.clone()));
            Ok(frame)
        } else {
            self.execute_node(&final_node, &opts)
        }
    }

    /// Materialize and hand back the result wrapped as a source node.
    pub fn materialize_as_planner_node(
        &self,
        tip: &NodeRef,
        opts: MaterializeOptions,
    ) -> Result<NodeRef> {
        let frame = self.materialize(tip, opts)?;
        Ok(sframe_source_contents(frame).into_ref())
    }

    /// Advises eager materialization once a lazy plan has grown past the
    /// configured dependency-node threshold.
    pub fn online_materialization_recommended(&self, tip: &NodeRef) -> bool {
        infer_num_dependency_nodes(tip) >= self.config.max_lazy_node_size
    }

    /// Materialize deeper nodes until the plan under `n` is one linear,
    /// uniformly slicable region, rewriting materialized nodes in place.
    fn partial_materialize_impl(
        &self,
        n: &NodeRef,
        opts: &MaterializeOptions,
        memo: &mut HashMap<usize, ()>,
    ) -> Result<()> {
        if memo.contains_key(&node_key(n)) {
            return Ok(());
        }
        let inputs = read_node(n).inputs.clone();
        for input in &inputs {
            self.partial_materialize_impl(input, opts, memo)?;
        }
        if inputs.is_empty() {
            debug_assert!(is_source_node(n));
            memo.insert(node_key(n), ());
            return Ok(());
        }

        if consumes_inputs_at_same_rate(n) {
            // all inputs must slice by the same segmentation; a second
            // distinct non-source code forces that input onto disk first
            let codes = parallel_slicable_codes(n);
            let mut allowed = if codes[0] != 1 { codes[0] } else { 0 };
            for (i, &c) in codes.iter().enumerate().skip(1) {
                if c == 1 {
                    continue;
                }
                if allowed == 0 {
                    allowed = c;
                } else if c != allowed {
                    tracing::debug!(plan = %node_repr(&inputs[i]), "partially materializing input");
                    let frame = self.execute_node(&inputs[i], opts)?;
                    replace_contents(&inputs[i], sframe_source_contents(frame));
                }
            }
        } else {
            // consumes inputs at different rates: materialize all of them
            for input in &inputs {
                if is_source_node(input) {
                    continue;
                }
                tracing::debug!(plan = %node_repr(input), "partially materializing input");
                let optimized = optimize_planner_graph(input, opts)?;
                let frame = self.execute_node(&optimized, opts)?;
                replace_contents(input, sframe_source_contents(frame));
            }
        }

        if is_linear_transform(n) || is_sublinear_transform(n) {
            memo.insert(node_key(n), ());
            return Ok(());
        }

        // not a streaming node at all: materialize it outright
        tracing::debug!(plan = %node_repr(n), "partially materializing node");
        let optimized = optimize_planner_graph(n, opts)?;
        let frame = self.execute_node(&optimized, opts)?;
        replace_contents(n, sframe_source_contents(frame));
        memo.insert(node_key(n), ());
        Ok(())
    }

    /// Error-checking strategy: recursively materialize every non-source
    /// input, ignoring slicing codes entirely.
    fn naive_partial_materialize(
        &self,
        n: &NodeRef,
        opts: &MaterializeOptions,
    ) -> Result<()> {
        let inputs = read_node(n).inputs.clone();
        for (i, input) in inputs.iter().enumerate() {
            if is_source_node(input) {
                continue;
            }
            self.naive_partial_materialize(input, opts)?;
            let frame = self.execute_node(input, opts)?;
            let source = sframe_source_contents(frame).into_ref();
            n.write().expect("planner node lock poisoned").inputs[i] = source;
        }
        Ok(())
    }

    /// Execute a linear plan, taking the cheap exits where the tip is
    /// already concrete.
    fn execute_node(&self, node: &NodeRef, opts: &MaterializeOptions) -> Result<SFrame> {
        let kind = read_node(node).kind;
        if opts.write_callback.is_none() {
            match kind {
                PlannerNodeType::SFrameSource => {
                    let n = read_node(node);
                    let frame = n.frame("frame")?;
                    if n.scalar_u64("begin_index")? == 0
                        && n.scalar_u64("end_index")? == frame.num_rows()
                    {
                        let frame = frame.clone();
                        drop(n);
                        return self.finish_frame(frame, opts);
                    }
                }
                PlannerNodeType::SArraySource => {
                    let n = read_node(node);
                    let column = n.column("column")?;
                    if n.scalar_u64("begin_index")? == 0
                        && n.scalar_u64("end_index")? == column.len()
                    {
                        let frame =
                            SFrame::from_columns(vec![column.clone()], vec!["X1".to_string()])?;
                        drop(n);
                        return self.finish_frame(frame, opts);
                    }
                }
                PlannerNodeType::GeneralizedUnionProject => {
                    if let Some(frame) = self.try_stitch_union_project(node, opts)? {
                        return self.finish_frame(frame, opts);
                    }
                }
                PlannerNodeType::Reduce => {
                    return self.execute_reduce(node, opts);
                }
                _ => {}
            }
        }
        self.execute_node_impl(node, opts)
    }

    /// Generalized-union-project pass-through: stored columns in the direct
    /// source mapping are forwarded as-is; only the gaps run through the
    /// pipeline, via a projection over just those positions.
    fn try_stitch_union_project(
        &self,
        node: &NodeRef,
        opts: &MaterializeOptions,
    ) -> Result<Option<SFrame>> {
        let mapping = {
            let n = read_node(node);
            match n.opaque("direct_source_mapping") {
                Ok(OpaqueParam::SourceMapping(m)) if !m.is_empty() => m.clone(),
                _ => return Ok(None),
            }
        };
        let ncols = infer_num_columns(node)?;
        let mut columns: Vec<Option<SArray>> = vec![None; ncols];
        let mut gaps = Vec::new();
        for i in 0..ncols {
            match mapping.get(&i) {
                Some(col) => columns[i] = Some(col.clone()),
                None => gaps.push(i),
            }
        }
        if !gaps.is_empty() {
            let rec = opts.for_recursion(opts.num_segments);
            let sub_tip = make_project_node(node.clone(), gaps.clone())?;
            let sub_tip = optimize_planner_graph(&sub_tip, &rec)?;
            tracing::debug!(columns = gaps.len(), "materializing column subset only");
            let sub = self.execute_node_impl(&sub_tip, &rec)?;
            for (j, &i) in gaps.iter().enumerate() {
                columns[i] = Some(sub.column(j).clone());
            }
        }
        let columns: Vec<SArray> = columns
            .into_iter()
            .map(|c| c.ok_or_else(|| SfqError::Internal("union-project column gap".into())))
            .collect::<Result<_>>()?;
        let names = default_names(columns.len());
        Ok(Some(SFrame::from_columns(columns, names)?))
    }

    /// Per-segment fold of the reduce input, combined serially on the
    /// driver, yielding the single-row result frame.
    fn execute_reduce(&self, node: &NodeRef, opts: &MaterializeOptions) -> Result<SFrame> {
        let (input, reducer, out_type) = {
            let n = read_node(node);
            (
                n.inputs[0].clone(),
                reducer_param(&n)?,
                n.types("output_types")?[0],
            )
        };
        let segments = self.plan_segments(&input, opts)?;
        let state = run_reduce(
            &segments,
            reducer,
            self.config.batch_size_rows,
            self.runtime.cancel_flag(),
        )?;
        let state = crate::execution::operators::conform_cell(state, out_type)?;
        let column = SArray::from_cells([state], out_type, 1)?;
        let frame = SFrame::from_columns(vec![column], vec!["X1".to_string()])?;
        self.finish_frame(frame, opts)
    }

    /// Clone the plan per segment when it slices; otherwise run it whole.
    fn plan_segments(&self, node: &NodeRef, opts: &MaterializeOptions) -> Result<Vec<NodeRef>> {
        if is_parallel_slicable(node) && opts.num_segments > 0 {
            let mut segments = Vec::with_capacity(opts.num_segments);
            for s in 0..opts.num_segments {
                let mut memo = HashMap::new();
                segments.push(make_segmented_graph(node, s, opts.num_segments, &mut memo)?);
            }
            Ok(segments)
        } else {
            Ok(vec![node.clone()])
        }
    }

    /// Stream the tip through the subplan executor.
    fn execute_node_impl(&self, node: &NodeRef, opts: &MaterializeOptions) -> Result<SFrame> {
        let segments = self.plan_segments(node, opts)?;
        if let Some(callback) = &opts.write_callback {
            run_to_callback(
                &segments,
                self.config.batch_size_rows,
                self.runtime.cancel_flag(),
                callback,
            )?;
            return Ok(SFrame::empty());
        }
        let ncols = infer_num_columns(node)?;
        let names = if opts.output_column_names.is_empty() {
            default_names(ncols)
        } else {
            check_name_count(&opts.output_column_names, ncols)?;
            opts.output_column_names.clone()
        };
        let frame = run_to_frame(
            &segments,
            names,
            self.config.batch_size_rows,
            self.runtime.cancel_flag(),
        )?;
        if let Some(path) = &opts.output_path {
            frame.save(path)?;
        }
        Ok(frame)
    }

    /// Apply output renames and persistence to an already-concrete frame.
    fn finish_frame(&self, frame: SFrame, opts: &MaterializeOptions) -> Result<SFrame> {
        let frame = if opts.output_column_names.is_empty() {
            frame
        } else {
            check_name_count(&opts.output_column_names, frame.num_columns())?;
            frame.with_column_names(opts.output_column_names.clone())?
        };
        if let Some(path) = &opts.output_path {
            frame.save(path)?;
        }
        Ok(frame)
    }
}

fn check_name_count(names: &[String], ncols: usize) -> Result<()> {
    if names.len() != ncols {
        return Err(SfqError::InvalidPlan(format!(
            "{} output column names for {ncols} columns",
            names.len()
        )));
    }
    Ok(())
}

fn default_names(ncols: usize) -> Vec<String> {
    (1..=ncols).map(|i| format!("X{i}")).collect()
}

/// Planner-node contents for a full-range source over `frame`.
pub fn sframe_source_contents(frame: SFrame) -> PlannerNode {
    let end = frame.num_rows() as i64;
    PlannerNode::new(PlannerNodeType::SFrameSource)
        .with_scalar("begin_index", 0i64)
        .with_scalar("end_index", end)
        .with_opaque("frame", OpaqueParam::Frame(frame))
}
