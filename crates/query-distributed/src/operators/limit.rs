//! Row limit; refusing further input is how it asks upstream to stop

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::error::Result;
use crate::fin::{Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::OperatorId;
use query_core::Tuple;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub limit: Option<u64>,
}

pub struct LimitOperator {
    id: OperatorId,
    config: LimitConfig,
    limit: u64,
    emitted: u64,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl LimitOperator {
    pub fn new(id: OperatorId, config: LimitConfig) -> Self {
        Self {
            id,
            config,
            limit: 0,
            emitted: 0,
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Limit.as_str()),
        }
    }
}

impl Operator for LimitOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Limit
    }

    fn init(&mut self, _ctx: &OperatorContext) -> Result<()> {
        self.limit = required(&self.config.limit, self.kind(), "limit")?;
        Ok(())
    }

    fn push_tuple(&mut self, _pin: usize, tuple: Tuple, output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        if self.emitted >= self.limit {
            return Ok(false);
        }
        self.emitted += 1;
        self.profile.record_tuple();
        let more = output.push(tuple)?;
        if self.emitted == self.limit {
            debug!(operator = %self.id, "Limit of {} reached", self.limit);
        }
        Ok(more && self.emitted < self.limit)
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
