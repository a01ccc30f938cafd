//! Task: one fragment's operators plus the driver loop that runs them
//!
//! Operators are stored in dependency order, so an operator's output always
//! lives at a larger index. Routing splits the node list at the producer and
//! hands the tail to the callee, which keeps every call a plain mutable
//! borrow.

use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, OperatorProfile};
use crate::operators::{OperatorContext, OperatorKind, OperatorNode, ResultSet};
use crate::plan::TaskPlan;
use crate::transport::TransportService;
use crate::types::{JobId, OperatorId, TaskId};
use query_core::Tuple;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct TaskNode {
    id: OperatorId,
    node: OperatorNode,
    /// (node index, pin) this operator emits into
    target: Option<(usize, usize)>,
    /// One flag per input pin; sources get a single pin fed by the driver
    pins_done: Vec<bool>,
    finished: bool,
    initialized: bool,
    destroyed: bool,
}

impl TaskNode {
    fn destroy(&mut self) {
        if self.initialized && !self.destroyed {
            self.destroyed = true;
            self.node.as_operator_mut().destroy();
        }
    }
}

/// What happened on the way through the operators
#[derive(Default)]
struct RunTrace {
    /// Innermost operator whose call failed
    culprit: Option<OperatorId>,
    /// First failure Fin routed between operators
    upstream_failure: Option<Failure>,
}

impl RunTrace {
    fn blame(&mut self, id: OperatorId) {
        if self.culprit.is_none() {
            self.culprit = Some(id);
        }
    }

    fn observe(&mut self, failure: &Failure) {
        if self.upstream_failure.is_none() {
            self.upstream_failure = Some(failure.clone());
        }
    }
}

/// Downstream handle given to an operator while it is being called
pub struct Output<'a> {
    nodes: &'a mut [TaskNode],
    /// Index of `nodes[0]` in the task
    base: usize,
    target: Option<(usize, usize)>,
    trace: &'a mut RunTrace,
}

/// Split off the node `target` points at and the nodes after it
fn split_target(
    nodes: &mut [TaskNode],
    base: usize,
    target: Option<(usize, usize)>,
) -> Result<(usize, usize, &mut TaskNode, &mut [TaskNode])> {
    let (index, pin) = target.ok_or_else(|| {
        DistributedError::Execution("Operator has no downstream output".to_string())
    })?;
    let (node, rest) = index
        .checked_sub(base)
        .and_then(|rel| nodes.get_mut(rel..))
        .and_then(|tail| tail.split_first_mut())
        .ok_or_else(|| {
            DistributedError::Execution(format!("Output target {} is not downstream", index))
        })?;
    Ok((index, pin, node, rest))
}

impl<'a> Output<'a> {
    /// Hand one tuple downstream. Returns false when downstream wants no more.
    pub fn push(&mut self, tuple: Tuple) -> Result<bool> {
        let (index, pin, node, rest) = split_target(self.nodes, self.base, self.target)?;
        if node.pins_done.get(pin).copied().unwrap_or(true) {
            return Err(DistributedError::ProtocolViolation(format!(
                "Tuple on pin {} of {} after its Fin",
                pin, node.id
            )));
        }
        let id = node.id;
        let mut downstream = Output {
            nodes: rest,
            base: index + 1,
            target: node.target,
            trace: &mut *self.trace,
        };
        let result = node
            .node
            .as_operator_mut()
            .push_tuple(pin, tuple, &mut downstream);
        if result.is_err() {
            self.trace.blame(id);
        }
        result
    }

    /// Hand the Fin of this stream downstream. Exactly once per pin.
    pub fn fin(&mut self, fin: Fin) -> Result<()> {
        let (index, pin, node, rest) = split_target(self.nodes, self.base, self.target)?;
        match node.pins_done.get_mut(pin) {
            Some(done) if !*done => *done = true,
            Some(_) => {
                return Err(DistributedError::ProtocolViolation(format!(
                    "Duplicate Fin on pin {} of {}",
                    pin, node.id
                )))
            }
            None => {
                return Err(DistributedError::ProtocolViolation(format!(
                    "Fin on unknown pin {} of {}",
                    pin, node.id
                )))
            }
        }
        if let Some(failure) = fin.failure() {
            self.trace.observe(failure);
        }

        let mut downstream = Output {
            nodes: rest,
            base: index + 1,
            target: node.target,
            trace: &mut *self.trace,
        };
        match node.node.as_operator_mut().fin(pin, fin, &mut downstream) {
            Ok(()) => {
                if node.pins_done.iter().all(|done| *done) {
                    node.finished = true;
                }
                Ok(())
            }
            Err(e) => {
                self.trace.blame(node.id);
                Err(e)
            }
        }
    }
}

/// Final state of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    /// This task raised the failure
    Failed { error: Failure },
    /// Only a failure propagated from upstream was observed
    UpstreamFailed { failure: Failure },
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Profile of every operator of this task, in plan order
    pub profiles: Vec<OperatorProfile>,
    /// One result set per Collect sink
    pub results: Vec<ResultSet>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// `Ok` for a completed task, otherwise the error that ended it
    pub fn check(&self) -> Result<()> {
        match &self.status {
            TaskStatus::Completed => Ok(()),
            TaskStatus::Failed { error } => Err(DistributedError::Execution(error.to_string())),
            TaskStatus::UpstreamFailed { failure } => {
                Err(DistributedError::UpstreamFailure(failure.clone()))
            }
        }
    }

    /// Failure that ended the task, whichever side raised it
    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            TaskStatus::Completed => None,
            TaskStatus::Failed { error } => Some(error),
            TaskStatus::UpstreamFailed { failure } => Some(failure),
        }
    }
}

/// One fragment of a job
pub struct Task {
    job_id: JobId,
    task_id: TaskId,
    nodes: Vec<TaskNode>,
    trace: RunTrace,
    transport: Option<Arc<TransportService>>,
}

impl Task {
    /// Build the operators of `plan` and check its structure
    pub fn from_plan(plan: TaskPlan) -> Result<Self> {
        let mut index_of = HashMap::with_capacity(plan.operators.len());
        for (idx, op) in plan.operators.iter().enumerate() {
            if index_of.insert(op.id, idx).is_some() {
                return Err(DistributedError::Configuration(format!(
                    "Duplicate operator id {}",
                    op.id
                )));
            }
        }

        let inputs = plan
            .operators
            .iter()
            .map(|op| op.config.input_count())
            .collect::<Result<Vec<_>>>()?;
        let mut feeders: Vec<Vec<usize>> = inputs.iter().map(|n| vec![0; *n]).collect();
        let mut nodes = Vec::with_capacity(plan.operators.len());

        for (idx, op) in plan.operators.iter().enumerate() {
            let kind = op.config.kind();
            let target = match (op.output, kind.is_sink()) {
                (Some(_), true) => {
                    return Err(DistributedError::Configuration(format!(
                        "{} operator {} cannot have an output",
                        kind, op.id
                    )))
                }
                (None, false) => {
                    return Err(DistributedError::Configuration(format!(
                        "{} operator {} has no output",
                        kind, op.id
                    )))
                }
                (None, true) => None,
                (Some(pin_ref), false) => {
                    let target = *index_of.get(&pin_ref.operator).ok_or_else(|| {
                        DistributedError::Configuration(format!(
                            "Operator {} outputs to unknown operator {}",
                            op.id, pin_ref.operator
                        ))
                    })?;
                    if target <= idx {
                        return Err(DistributedError::Configuration(format!(
                            "Operator {} outputs to {}, which is not after it",
                            op.id, pin_ref.operator
                        )));
                    }
                    let slot = feeders[target].get_mut(pin_ref.pin).ok_or_else(|| {
                        DistributedError::Configuration(format!(
                            "Operator {} has no input pin {}",
                            pin_ref.operator, pin_ref.pin
                        ))
                    })?;
                    *slot += 1;
                    Some((target, pin_ref.pin))
                }
            };

            nodes.push(TaskNode {
                id: op.id,
                node: OperatorNode::from_config(op.id, &op.config),
                target,
                pins_done: vec![false; inputs[idx].max(1)],
                finished: false,
                initialized: false,
                destroyed: false,
            });
        }

        for (idx, pins) in feeders.iter().enumerate() {
            if let Some(pin) = pins.iter().position(|count| *count != 1) {
                return Err(DistributedError::Configuration(format!(
                    "Pin {} of operator {} has {} feeders, expected exactly one",
                    pin, nodes[idx].id, pins[pin]
                )));
            }
        }
        if !nodes.iter().any(|n| n.node.kind().is_source()) {
            return Err(DistributedError::Configuration(
                "Task has no source operator".to_string(),
            ));
        }

        Ok(Self {
            job_id: plan.job_id,
            task_id: plan.task_id,
            nodes,
            trace: RunTrace::default(),
            transport: None,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn operator_count(&self) -> usize {
        self.nodes.len()
    }

    /// Initialize every operator in dependency order.
    ///
    /// On failure the Send operators of the task still get to tell their
    /// receivers: those not initialized yet connect, then every initialized
    /// operator is aborted and destroyed.
    pub fn init(&mut self, transport: Arc<TransportService>) -> Result<()> {
        for idx in 0..self.nodes.len() {
            if let Err(e) = self.init_node(idx, &transport) {
                let id = self.nodes[idx].id;
                error!(task = %self.task_id, operator = %id, "Init failed: {}", e);
                let failure = Failure::new(format!("{}/{}", self.task_id, id), e.to_string());
                self.connect_remaining_sends(idx + 1, &transport);
                self.abort_unfinished(&failure);
                self.destroy_all();
                return Err(e);
            }
        }
        self.transport = Some(transport);
        debug!(task = %self.task_id, "Initialized {} operators", self.nodes.len());
        Ok(())
    }

    fn init_node(&mut self, idx: usize, transport: &Arc<TransportService>) -> Result<()> {
        let ctx = OperatorContext {
            job_id: self.job_id,
            task_id: self.task_id,
            operator_id: self.nodes[idx].id,
            transport: transport.clone(),
        };
        let node = &mut self.nodes[idx];
        node.initialized = true;
        node.node.as_operator_mut().init(&ctx)
    }

    /// Best effort: a Send that cannot connect has no receiver to tell
    fn connect_remaining_sends(&mut self, from: usize, transport: &Arc<TransportService>) {
        for idx in from..self.nodes.len() {
            if self.nodes[idx].node.kind() != OperatorKind::Send {
                continue;
            }
            if let Err(e) = self.init_node(idx, transport) {
                warn!(
                    task = %self.task_id,
                    operator = %self.nodes[idx].id,
                    "Cannot reach receiver to report init failure: {}", e
                );
            }
        }
    }

    /// Drive the task to completion and tear it down
    pub fn run(mut self) -> TaskOutcome {
        info!(task = %self.task_id, job = %self.job_id, "Task started");

        let status = match self.drive() {
            Ok(()) => match self.trace.upstream_failure.take() {
                Some(failure) => {
                    warn!(task = %self.task_id, "Task finished after upstream failure: {}", failure);
                    TaskStatus::UpstreamFailed { failure }
                }
                None => TaskStatus::Completed,
            },
            Err(e) => {
                let culprit = self
                    .trace
                    .culprit
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "driver".to_string());
                let failure = Failure::new(format!("{}/{}", self.task_id, culprit), e.to_string());
                error!(task = %self.task_id, "Task failed: {}", failure);
                self.abort_unfinished(&failure);
                TaskStatus::Failed { error: failure }
            }
        };

        self.destroy_all();
        let profiles = self.nodes.iter().map(|n| n.node.profile().clone()).collect();
        let results = self
            .nodes
            .iter_mut()
            .filter_map(|n| n.node.take_results())
            .collect();
        info!(task = %self.task_id, "Task finished: {:?}", status);

        TaskOutcome {
            task_id: self.task_id,
            status,
            profiles,
            results,
        }
    }

    /// Round-robin over the sources until all of them delivered their Fin
    fn drive(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return Err(DistributedError::Execution(
                "Task was not initialized".to_string(),
            ));
        }

        let mut active: Vec<usize> = (0..self.nodes.len())
            .filter(|idx| self.nodes[*idx].node.kind().is_source())
            .collect();
        let mut cursor = 0;
        while !active.is_empty() {
            let idx = active[cursor];
            if self.push_source(idx)? {
                cursor += 1;
            } else {
                self.finish_source(idx)?;
                active.remove(cursor);
            }
            if cursor >= active.len() {
                cursor = 0;
            }
        }

        if let Some(node) = self.nodes.iter().find(|n| !n.finished) {
            return Err(DistributedError::ProtocolViolation(format!(
                "Operator {} did not receive all its Fins",
                node.id
            )));
        }
        Ok(())
    }

    fn push_source(&mut self, idx: usize) -> Result<bool> {
        let (head, rest) = self.nodes.split_at_mut(idx + 1);
        let node = &mut head[idx];
        let mut output = Output {
            nodes: rest,
            base: idx + 1,
            target: node.target,
            trace: &mut self.trace,
        };
        let result = node.node.as_operator_mut().push(&mut output);
        if result.is_err() {
            self.trace.blame(node.id);
        }
        result
    }

    /// Deliver the driver's Fin to a drained source
    fn finish_source(&mut self, idx: usize) -> Result<()> {
        let (head, rest) = self.nodes.split_at_mut(idx + 1);
        let node = &mut head[idx];
        node.pins_done[0] = true;
        let mut output = Output {
            nodes: rest,
            base: idx + 1,
            target: node.target,
            trace: &mut self.trace,
        };
        match node.node.as_operator_mut().fin(0, Fin::Plain, &mut output) {
            Ok(()) => {
                node.finished = true;
                Ok(())
            }
            Err(e) => {
                self.trace.blame(node.id);
                Err(e)
            }
        }
    }

    fn abort_unfinished(&mut self, failure: &Failure) {
        for node in self.nodes.iter_mut().filter(|n| n.initialized && !n.finished) {
            debug!(task = %self.task_id, operator = %node.id, "Aborting operator");
            node.node.as_operator_mut().abort(failure);
        }
    }

    fn destroy_all(&mut self) {
        for node in &mut self.nodes {
            node.destroy();
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use crate::operators::{
        CollectConfig, LimitConfig, ProjectConfig, UnionConfig, ValuesConfig,
    };
    use crate::plan::{OperatorConfig, OperatorPlan};
    use query_core::{DataType, Field, Schema, Value};

    fn transport() -> Arc<TransportService> {
        Arc::new(TransportService::new(NetworkConfig::default()).unwrap())
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    fn values(range: std::ops::Range<i64>) -> OperatorConfig {
        OperatorConfig::Values(ValuesConfig {
            schema: Some(schema()),
            rows: range
                .map(|i| vec![Value::Int64(i), Value::Utf8(format!("row{}", i))])
                .collect(),
        })
    }

    fn collect(schema: Schema) -> OperatorConfig {
        OperatorConfig::Collect(CollectConfig {
            schema: Some(schema),
        })
    }

    fn run(plan: TaskPlan) -> TaskOutcome {
        let mut task = Task::from_plan(plan).unwrap();
        task.init(transport()).unwrap();
        task.run()
    }

    #[test]
    fn test_local_pipeline() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                values(0..3000),
                OperatorConfig::Project(ProjectConfig {
                    columns: Some(vec![1, 0]),
                }),
                collect(schema().project(&[1, 0]).unwrap()),
            ],
        );
        let outcome = run(plan);
        assert_eq!(outcome.status, TaskStatus::Completed);

        let result = &outcome.results[0];
        assert_eq!(result.len(), 3000);
        assert_eq!(
            result.rows[2999],
            vec![Value::Utf8("row2999".into()), Value::Int64(2999)]
        );
        assert_eq!(result.profiles().len(), 3);
        assert!(outcome.profiles.iter().all(|p| p.processed == 3000));

        let batch = result.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 3000);
    }

    #[test]
    fn test_limit_stops_the_source() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                values(0..5000),
                OperatorConfig::Limit(LimitConfig { limit: Some(10) }),
                collect(schema()),
            ],
        );
        let outcome = run(plan);
        assert!(outcome.is_success());
        assert_eq!(outcome.results[0].len(), 10);
        // The source stops as soon as the limit refuses
        assert_eq!(outcome.profiles[0].processed, 10);
    }

    #[test]
    fn test_union_emits_one_fin_after_all_inputs() {
        let union = OperatorPlan::new(OperatorConfig::Union(UnionConfig { inputs: Some(2) }));
        let sink = OperatorPlan::new(collect(schema()));
        let plan = TaskPlan::new(
            JobId::new(),
            vec![
                OperatorPlan::new(values(0..1500)).with_output(union.id, 0),
                OperatorPlan::new(values(1500..2000)).with_output(union.id, 1),
                union.clone().with_output(sink.id, 0),
                sink,
            ],
        );
        let outcome = run(plan);
        assert!(outcome.is_success());
        let result = &outcome.results[0];
        assert_eq!(result.len(), 2000);
        // two sources, the union and the sink
        assert_eq!(result.profiles().len(), 4);

        let mut ids: Vec<i64> = result
            .rows
            .iter()
            .map(|row| match row[0] {
                Value::Int64(i) => i,
                _ => -1,
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn test_operator_error_fails_the_task() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                values(0..10),
                OperatorConfig::Project(ProjectConfig {
                    columns: Some(vec![5]),
                }),
                collect(schema()),
            ],
        );
        let project_id = plan.operator_id(1).unwrap();
        let task_id = plan.task_id;
        let outcome = run(plan);

        match &outcome.status {
            TaskStatus::Failed { error } => {
                assert_eq!(error.origin, format!("{}/{}", task_id, project_id));
                assert!(error.message.contains("out of range"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        // The sink learns about the failure through abort
        assert_eq!(outcome.results[0].failure(), outcome.failure());
    }

    #[test]
    fn test_missing_config_fails_init() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                values(0..1),
                OperatorConfig::Limit(LimitConfig::default()),
                collect(schema()),
            ],
        );
        let mut task = Task::from_plan(plan).unwrap();
        assert!(matches!(
            task.init(transport()),
            Err(DistributedError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_values_row_fails_init() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                OperatorConfig::Values(ValuesConfig {
                    schema: Some(schema()),
                    rows: vec![vec![Value::Null, Value::Null]],
                }),
                collect(schema()),
            ],
        );
        let mut task = Task::from_plan(plan).unwrap();
        assert!(matches!(
            task.init(transport()),
            Err(DistributedError::Configuration(_))
        ));
    }

    #[test]
    fn test_structural_checks() {
        // output pointing backwards
        let sink = OperatorPlan::new(collect(schema()));
        let plan = TaskPlan::new(
            JobId::new(),
            vec![sink.clone(), OperatorPlan::new(values(0..1)).with_output(sink.id, 0)],
        );
        assert!(matches!(
            Task::from_plan(plan),
            Err(DistributedError::Configuration(_))
        ));

        // sink with an output
        let values_op = OperatorPlan::new(values(0..1));
        let sink = OperatorPlan::new(collect(schema()));
        let plan = TaskPlan::new(
            JobId::new(),
            vec![values_op.clone(), sink.clone().with_output(values_op.id, 0)],
        );
        assert!(Task::from_plan(plan).is_err());

        // union pin without a feeder
        let union = OperatorPlan::new(OperatorConfig::Union(UnionConfig { inputs: Some(2) }));
        let sink = OperatorPlan::new(collect(schema()));
        let plan = TaskPlan::new(
            JobId::new(),
            vec![
                OperatorPlan::new(values(0..1)).with_output(union.id, 0),
                union.clone().with_output(sink.id, 0),
                sink,
            ],
        );
        let err = Task::from_plan(plan).err().unwrap();
        assert!(err.to_string().contains("0 feeders"));

        // duplicate ids
        let op = OperatorPlan::new(values(0..1));
        let plan = TaskPlan::new(JobId::new(), vec![op.clone(), op]);
        assert!(Task::from_plan(plan).is_err());

        // no source
        let plan = TaskPlan::new(JobId::new(), vec![OperatorPlan::new(collect(schema()))]);
        assert!(Task::from_plan(plan).is_err());
    }

    #[test]
    fn test_run_without_init_fails() {
        let plan = TaskPlan::pipeline(JobId::new(), vec![values(0..1), collect(schema())]);
        let outcome = Task::from_plan(plan).unwrap().run();
        assert!(matches!(outcome.status, TaskStatus::Failed { .. }));
    }
}
