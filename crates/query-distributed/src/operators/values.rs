//! In-memory row source

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::error::{DistributedError, Result};
use crate::fin::{Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::OperatorId;
use query_core::{Schema, Tuple};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rows emitted per driver turn before yielding to other sources
const ROWS_PER_PUSH: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuesConfig {
    pub schema: Option<Schema>,
    pub rows: Vec<Tuple>,
}

/// Source emitting a fixed list of rows
pub struct ValuesOperator {
    id: OperatorId,
    config: ValuesConfig,
    cursor: usize,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl ValuesOperator {
    pub fn new(id: OperatorId, config: ValuesConfig) -> Self {
        Self {
            id,
            config,
            cursor: 0,
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Values.as_str()),
        }
    }
}

impl Operator for ValuesOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Values
    }

    fn inputs(&self) -> usize {
        0
    }

    fn init(&mut self, _ctx: &OperatorContext) -> Result<()> {
        let schema = required(&self.config.schema, self.kind(), "schema")?;
        for (idx, row) in self.config.rows.iter().enumerate() {
            schema.validate(row).map_err(|e| {
                DistributedError::Configuration(format!("Values row {} is invalid: {}", idx, e))
            })?;
        }
        Ok(())
    }

    fn push(&mut self, output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        let end = (self.cursor + ROWS_PER_PUSH).min(self.config.rows.len());
        while self.cursor < end {
            let row = self.config.rows[self.cursor].clone();
            self.cursor += 1;
            self.profile.record_tuple();
            if !output.push(row)? {
                debug!(operator = %self.id, "Downstream refused after {} rows", self.cursor);
                return Ok(false);
            }
        }
        Ok(self.cursor < self.config.rows.len())
    }

    fn fin(&mut self, pin: usize, fin: Fin, output: &mut Output<'_>) -> Result<()> {
        if self.collector.absorb(pin, fin)? {
            output.fin(self.collector.finish(self.profile.finish()))?;
        }
        Ok(())
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
