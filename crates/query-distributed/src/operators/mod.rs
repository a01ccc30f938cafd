//! Push-driven operators
//!
//! A source is driven by the task through [`Operator::push`]; every other
//! operator receives tuples from its upstream through
//! [`Operator::push_tuple`]. A `false` return asks the caller to stop
//! producing. Each input pin receives exactly one Fin, and an operator emits
//! its own Fin downstream once all its pins have finished.

mod collect;
mod limit;
mod project;
mod receive;
mod send;
mod union;
mod values;

pub use collect::{CollectConfig, CollectOperator, ResultSet};
pub use limit::{LimitConfig, LimitOperator};
pub use project::{ProjectConfig, ProjectOperator};
pub use receive::{ReceiveConfig, ReceiveHandler, ReceiveOperator};
pub use send::{SendConfig, SendOperator, SendTarget};
pub use union::{UnionConfig, UnionOperator};
pub use values::{ValuesConfig, ValuesOperator};

use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, OperatorProfile};
use crate::plan::OperatorConfig;
use crate::task::Output;
use crate::transport::TransportService;
use crate::types::{JobId, OperatorId, TaskId};
use query_core::Tuple;
use std::fmt;
use std::sync::Arc;

/// Everything an operator may need while acquiring its resources
#[derive(Clone)]
pub struct OperatorContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub operator_id: OperatorId,
    pub transport: Arc<TransportService>,
}

/// Operator kinds known to the plan format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Values,
    Receive,
    Send,
    Project,
    Limit,
    Union,
    Collect,
}

impl OperatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Values => "values",
            OperatorKind::Receive => "receive",
            OperatorKind::Send => "send",
            OperatorKind::Project => "project",
            OperatorKind::Limit => "limit",
            OperatorKind::Union => "union",
            OperatorKind::Collect => "collect",
        }
    }

    /// Sources are driven by the task instead of an upstream operator
    pub fn is_source(&self) -> bool {
        matches!(self, OperatorKind::Values | OperatorKind::Receive)
    }

    /// Sinks have no downstream output
    pub fn is_sink(&self) -> bool {
        matches!(self, OperatorKind::Send | OperatorKind::Collect)
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push-based operator contract
pub trait Operator {
    fn id(&self) -> OperatorId;

    fn kind(&self) -> OperatorKind;

    /// Number of upstream input pins; sources have none
    fn inputs(&self) -> usize {
        1
    }

    /// Validate configuration and acquire resources
    fn init(&mut self, ctx: &OperatorContext) -> Result<()>;

    /// Produce tuples into `output`. Returns false once the source is
    /// exhausted or downstream refused more data.
    fn push(&mut self, _output: &mut Output<'_>) -> Result<bool> {
        Err(DistributedError::Execution(format!(
            "{} operator {} is not a source",
            self.kind(),
            self.id()
        )))
    }

    /// Accept one tuple on `pin`. Returns false to ask upstream to stop.
    fn push_tuple(&mut self, _pin: usize, _tuple: Tuple, _output: &mut Output<'_>) -> Result<bool> {
        Err(DistributedError::Execution(format!(
            "{} operator {} does not accept input tuples",
            self.kind(),
            self.id()
        )))
    }

    /// Accept the Fin of `pin`
    fn fin(&mut self, pin: usize, fin: Fin, output: &mut Output<'_>) -> Result<()>;

    /// The task failed before this operator finished
    fn abort(&mut self, _failure: &Failure) {}

    /// Release resources. Called exactly once, on every exit path.
    fn destroy(&mut self) {}

    fn profile(&self) -> &OperatorProfile;
}

/// Closed set of operator implementations
pub enum OperatorNode {
    Values(ValuesOperator),
    Receive(ReceiveOperator),
    Send(SendOperator),
    Project(ProjectOperator),
    Limit(LimitOperator),
    Union(UnionOperator),
    Collect(CollectOperator),
}

impl OperatorNode {
    /// Instantiate the operator described by `config`. Configuration is only
    /// validated by `init`.
    pub fn from_config(id: OperatorId, config: &OperatorConfig) -> Self {
        match config {
            OperatorConfig::Values(c) => OperatorNode::Values(ValuesOperator::new(id, c.clone())),
            OperatorConfig::Receive(c) => {
                OperatorNode::Receive(ReceiveOperator::new(id, c.clone()))
            }
            OperatorConfig::Send(c) => OperatorNode::Send(SendOperator::new(id, c.clone())),
            OperatorConfig::Project(c) => {
                OperatorNode::Project(ProjectOperator::new(id, c.clone()))
            }
            OperatorConfig::Limit(c) => OperatorNode::Limit(LimitOperator::new(id, c.clone())),
            OperatorConfig::Union(c) => OperatorNode::Union(UnionOperator::new(id, c.clone())),
            OperatorConfig::Collect(c) => {
                OperatorNode::Collect(CollectOperator::new(id, c.clone()))
            }
        }
    }

    pub fn as_operator(&self) -> &dyn Operator {
        match self {
            OperatorNode::Values(op) => op,
            OperatorNode::Receive(op) => op,
            OperatorNode::Send(op) => op,
            OperatorNode::Project(op) => op,
            OperatorNode::Limit(op) => op,
            OperatorNode::Union(op) => op,
            OperatorNode::Collect(op) => op,
        }
    }

    pub fn as_operator_mut(&mut self) -> &mut dyn Operator {
        match self {
            OperatorNode::Values(op) => op,
            OperatorNode::Receive(op) => op,
            OperatorNode::Send(op) => op,
            OperatorNode::Project(op) => op,
            OperatorNode::Limit(op) => op,
            OperatorNode::Union(op) => op,
            OperatorNode::Collect(op) => op,
        }
    }

    pub fn id(&self) -> OperatorId {
        self.as_operator().id()
    }

    pub fn kind(&self) -> OperatorKind {
        self.as_operator().kind()
    }

    pub fn profile(&self) -> &OperatorProfile {
        self.as_operator().profile()
    }

    /// Collected rows, for Collect sinks
    pub fn take_results(&mut self) -> Option<ResultSet> {
        match self {
            OperatorNode::Collect(op) => Some(op.take_results()),
            _ => None,
        }
    }
}

/// Fetch a required configuration field
pub(crate) fn required<T: Clone>(value: &Option<T>, kind: OperatorKind, field: &str) -> Result<T> {
    value.clone().ok_or_else(|| {
        DistributedError::Configuration(format!("{} operator requires `{}`", kind, field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(OperatorKind::Receive.is_source());
        assert!(!OperatorKind::Receive.is_sink());
        assert!(OperatorKind::Send.is_sink());
        assert!(!OperatorKind::Union.is_source());
        assert!(!OperatorKind::Union.is_sink());
        assert_eq!(OperatorKind::Collect.to_string(), "collect");
    }

    #[test]
    fn test_required_field() {
        let missing: Option<u16> = None;
        let err = required(&missing, OperatorKind::Receive, "port").unwrap_err();
        assert!(matches!(err, DistributedError::Configuration(_)));
        assert!(err.to_string().contains("`port`"));
        assert_eq!(required(&Some(7u16), OperatorKind::Receive, "port").unwrap(), 7);
    }
}
