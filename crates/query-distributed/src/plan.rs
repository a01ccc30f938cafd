//! Task plan records
//!
//! A plan lists the operators of one task in dependency order: every
//! operator's output points at an operator further down the list.

use crate::error::{DistributedError, Result};
use crate::operators::{
    CollectConfig, LimitConfig, OperatorKind, ProjectConfig, ReceiveConfig, SendConfig,
    UnionConfig, ValuesConfig,
};
use crate::types::{JobId, OperatorId, TaskId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Operator configuration, tagged by kind.
///
/// Fields are optional at parse time; a missing required field is reported
/// when the operator is initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorConfig {
    Values(ValuesConfig),
    Receive(ReceiveConfig),
    Send(SendConfig),
    Project(ProjectConfig),
    Limit(LimitConfig),
    Union(UnionConfig),
    Collect(CollectConfig),
}

impl OperatorConfig {
    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorConfig::Values(_) => OperatorKind::Values,
            OperatorConfig::Receive(_) => OperatorKind::Receive,
            OperatorConfig::Send(_) => OperatorKind::Send,
            OperatorConfig::Project(_) => OperatorKind::Project,
            OperatorConfig::Limit(_) => OperatorKind::Limit,
            OperatorConfig::Union(_) => OperatorKind::Union,
            OperatorConfig::Collect(_) => OperatorKind::Collect,
        }
    }

    /// Number of input pins the operator exposes
    pub fn input_count(&self) -> Result<usize> {
        match self {
            OperatorConfig::Values(_) | OperatorConfig::Receive(_) => Ok(0),
            OperatorConfig::Union(c) => match c.inputs {
                Some(n) if n > 0 => Ok(n),
                _ => Err(DistributedError::Configuration(
                    "union operator requires `inputs` of at least 1".to_string(),
                )),
            },
            _ => Ok(1),
        }
    }
}

/// Input pin of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRef {
    pub operator: OperatorId,
    #[serde(default)]
    pub pin: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorPlan {
    pub id: OperatorId,
    pub config: OperatorConfig,
    #[serde(default)]
    pub output: Option<PinRef>,
}

impl OperatorPlan {
    /// Operator with a fresh id and no output
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            id: OperatorId::new(),
            config,
            output: None,
        }
    }

    pub fn with_output(mut self, operator: OperatorId, pin: usize) -> Self {
        self.output = Some(PinRef { operator, pin });
        self
    }
}

/// One fragment of a job, executed by a single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub operators: Vec<OperatorPlan>,
}

impl TaskPlan {
    pub fn new(job_id: JobId, operators: Vec<OperatorPlan>) -> Self {
        Self {
            job_id,
            task_id: TaskId::new(),
            operators,
        }
    }

    /// Linear pipeline where each operator feeds pin 0 of the next one
    pub fn pipeline(job_id: JobId, configs: Vec<OperatorConfig>) -> Self {
        let mut operators: Vec<OperatorPlan> = configs.into_iter().map(OperatorPlan::new).collect();
        for idx in 1..operators.len() {
            let next = operators[idx].id;
            operators[idx - 1].output = Some(PinRef {
                operator: next,
                pin: 0,
            });
        }
        Self::new(job_id, operators)
    }

    /// Id of the operator at `index`
    pub fn operator_id(&self, index: usize) -> Option<OperatorId> {
        self.operators.get(index).map(|op| op.id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DistributedError::Configuration(format!("Invalid task plan: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| {
            DistributedError::Configuration(format!("{}: {}", path.display(), e))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DistributedError::Configuration(format!("Cannot encode task plan: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "job_id": "6f1c1f3e-41a9-4a39-b5a2-1b9a1d5c0e01",
        "task_id": "0b2f7c3d-2f64-4f0e-9a7e-2f8c8d3c9a11",
        "operators": [
            {
                "id": "a1a1a1a1-0000-4000-8000-000000000001",
                "config": {
                    "kind": "values",
                    "schema": [{"name": "id", "data_type": "Int64", "nullable": false}],
                    "rows": [[{"Int64": 1}], [{"Int64": 2}]]
                },
                "output": {"operator": "a1a1a1a1-0000-4000-8000-000000000002"}
            },
            {
                "id": "a1a1a1a1-0000-4000-8000-000000000002",
                "config": {"kind": "collect", "schema": [{"name": "id", "data_type": "Int64"}]}
            }
        ]
    }"#;

    #[test]
    fn test_parse_plan() {
        let plan = TaskPlan::from_json(PLAN).unwrap();
        assert_eq!(plan.operators.len(), 2);
        assert_eq!(plan.operators[0].config.kind(), OperatorKind::Values);
        assert_eq!(plan.operators[0].output.unwrap().pin, 0);
        assert!(plan.operators[1].output.is_none());
        match &plan.operators[0].config {
            OperatorConfig::Values(c) => assert_eq!(c.rows.len(), 2),
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields_parse() {
        let plan = TaskPlan::from_json(
            r#"{"job_id": "6f1c1f3e-41a9-4a39-b5a2-1b9a1d5c0e01",
                "task_id": "0b2f7c3d-2f64-4f0e-9a7e-2f8c8d3c9a11",
                "operators": [{"id": "a1a1a1a1-0000-4000-8000-000000000001",
                               "config": {"kind": "receive", "host": "127.0.0.1"}}]}"#,
        )
        .unwrap();
        match &plan.operators[0].config {
            OperatorConfig::Receive(c) => assert!(c.port.is_none()),
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = TaskPlan::from_json(
            r#"{"job_id": "6f1c1f3e-41a9-4a39-b5a2-1b9a1d5c0e01",
                "task_id": "0b2f7c3d-2f64-4f0e-9a7e-2f8c8d3c9a11",
                "operators": [{"id": "a1a1a1a1-0000-4000-8000-000000000001",
                               "config": {"kind": "sort"}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DistributedError::Configuration(_)));
    }

    #[test]
    fn test_pipeline_wiring() {
        let plan = TaskPlan::pipeline(
            JobId::new(),
            vec![
                OperatorConfig::Values(ValuesConfig::default()),
                OperatorConfig::Limit(LimitConfig { limit: Some(1) }),
                OperatorConfig::Collect(CollectConfig::default()),
            ],
        );
        assert_eq!(plan.operators[0].output.unwrap().operator, plan.operators[1].id);
        assert_eq!(plan.operators[1].output.unwrap().operator, plan.operators[2].id);
        assert!(plan.operators[2].output.is_none());

        let reparsed = TaskPlan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.task_id, plan.task_id);
    }

    #[test]
    fn test_input_counts() {
        assert_eq!(
            OperatorConfig::Receive(ReceiveConfig::default()).input_count().unwrap(),
            0
        );
        assert_eq!(
            OperatorConfig::Union(UnionConfig { inputs: Some(3) }).input_count().unwrap(),
            3
        );
        assert!(OperatorConfig::Union(UnionConfig::default()).input_count().is_err());
    }
}
