//! The SFQ query engine: a lazy, columnar dataframe engine.
//!
//! Architecture role:
//! - [`planning`]: the logical operator DAG, pure inference over it, the
//!   rule-driven rewriter, and the materialization driver
//! - [`execution`]: the pull-based pipeline of rate-coupled execution
//!   nodes, the operator implementations, and the per-segment subplan
//!   executor
//!
//! Callers compose plans with the `make_*_node` constructors (re-exported
//! below), then hand a tip to [`Planner::materialize`]. Everything else is
//! plumbing between those two points.

pub mod execution;
pub mod planning;

pub use execution::batch::{RowBatch, RowBuffer, RowRef};
pub use execution::context::{EmitState, QueryContext};
pub use execution::exec_node::{ExecutionNode, InputEdge};
pub use execution::executor::{
    build_execution_graph, run_reduce, run_to_callback, run_to_frame, WriteCallback,
};
pub use execution::lambda::{InProcessLambdaChannel, LambdaChannel, LambdaEvalFn};
pub use execution::operators::append::make_append_node;
pub use execution::operators::filter::make_logical_filter_node;
pub use execution::operators::lambda_transform::make_lambda_transform_node;
pub use execution::operators::make_identity_node;
pub use execution::operators::project::{
    make_generalized_union_project_node, make_project_node, make_union_node,
};
pub use execution::operators::reduce::{
    make_reduce_node, CountReducer, MinReducer, ReduceFunction, SumReducer,
};
pub use execution::operators::source::{
    make_constant_node, make_range_node, make_sarray_source_node,
    make_sarray_source_range_node, make_sframe_source_node, make_sframe_source_range_node,
};
pub use execution::operators::transform::{
    make_binary_transform_node, make_generalized_transform_node, make_transform_node,
};
pub use execution::operators::{planner_node_to_operator, QueryOperator};
pub use planning::infer::{
    infer_dtype, infer_length, infer_num_columns, infer_num_dependency_nodes,
};
pub use planning::node::{
    node_repr, read_node, replace_contents, BinaryMapFn, LambdaSpec, MultiMapFn, NodeRef,
    OpaqueParam, PlannerNode, RowMapFn,
};
pub use planning::optimizer::{optimize_planner_graph, OptEngine, OptRule};
pub use planning::planner::{MaterializeOptions, Planner};
pub use planning::registry::{
    attributes_of, consumes_inputs_at_same_rate, is_linear_transform, is_parallel_slicable,
    is_source_node, is_sublinear_transform, parallel_slicable_codes, InputArity,
    PlannerNodeType, QueryOperatorAttributes,
};
pub use planning::segment::{make_segmented_graph, slice_range};
