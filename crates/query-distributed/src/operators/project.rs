//! Column selection and reordering

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::error::{DistributedError, Result};
use crate::fin::{Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::OperatorId;
use query_core::Tuple;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Input column index for each output column
    pub columns: Option<Vec<usize>>,
}

pub struct ProjectOperator {
    id: OperatorId,
    config: ProjectConfig,
    columns: Vec<usize>,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl ProjectOperator {
    pub fn new(id: OperatorId, config: ProjectConfig) -> Self {
        Self {
            id,
            config,
            columns: Vec::new(),
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Project.as_str()),
        }
    }
}

impl Operator for ProjectOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Project
    }

    fn init(&mut self, _ctx: &OperatorContext) -> Result<()> {
        self.columns = required(&self.config.columns, self.kind(), "columns")?;
        Ok(())
    }

    fn push_tuple(&mut self, _pin: usize, tuple: Tuple, output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        let projected = self
            .columns
            .iter()
            .map(|&idx| {
                tuple.get(idx).cloned().ok_or_else(|| {
                    DistributedError::Execution(format!(
                        "Column {} out of range for a tuple of {} columns",
                        idx,
                        tuple.len()
                    ))
                })
            })
            .collect::<Result<Tuple>>()?;
        self.profile.record_tuple();
        output.push(projected)
    }

    fn fin(&mut self, pin: usize, fin: Fin, output: &mut Output<'_>) -> Result<()> {
        self.profile.start();
        if self.collector.absorb(pin, fin)? {
            output.fin(self.collector.finish(self.profile.finish()))?;
        }
        Ok(())
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
