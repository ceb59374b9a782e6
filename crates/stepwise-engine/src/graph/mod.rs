//! Graph compiler and driver.
//!
//! A workflow compiles into a [`CompiledGraph`]: a node-id keyed map of bound
//! nodes plus one transition per node. Transitions are either a direct
//! successor or an ordered list of routes whose conditions are evaluated
//! against state, first match wins. Fan-out nodes run another node once per
//! list element and collect the results in item order.
//!
//! [`CompiledGraph::invoke`] walks the graph from the entry node until `END`,
//! merging each node's delta into state through the state model.

pub mod builder;
pub mod compiled;
pub mod condition;
pub mod fanout;

pub use builder::GraphBuilder;
pub use compiled::{
    CompiledGraph, CompiledNode, ExecutionLimits, GraphOutcome, NodeResult, Route,
    RouteCondition, RunContext, Target, Transition,
};
pub use condition::Condition;
pub use fanout::{FanOutDispatcher, FanOutOutput};
