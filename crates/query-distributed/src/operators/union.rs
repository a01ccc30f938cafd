//! Fan-in of several input pins into one stream

use super::{Operator, OperatorContext, OperatorKind};
use crate::error::{DistributedError, Result};
use crate::fin::{Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::OperatorId;
use query_core::Tuple;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnionConfig {
    /// Number of input pins
    pub inputs: Option<usize>,
}

/// Forwards tuples from every pin and emits a single Fin after the last pin
/// finished
pub struct UnionOperator {
    id: OperatorId,
    inputs: usize,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl UnionOperator {
    pub fn new(id: OperatorId, config: UnionConfig) -> Self {
        let inputs = config.inputs.unwrap_or(0);
        Self {
            id,
            inputs,
            collector: FinCollector::new(inputs),
            profile: OperatorProfile::new(id, OperatorKind::Union.as_str()),
        }
    }
}

impl Operator for UnionOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Union
    }

    fn inputs(&self) -> usize {
        self.inputs
    }

    fn init(&mut self, _ctx: &OperatorContext) -> Result<()> {
        if self.inputs == 0 {
            return Err(DistributedError::Configuration(
                "union operator requires `inputs` of at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn push_tuple(&mut self, _pin: usize, tuple: Tuple, output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        self.profile.record_tuple();
        output.push(tuple)
    }

    fn fin(&mut self, pin: usize, fin: Fin, output: &mut Output<'_>) -> Result<()> {
        self.profile.start();
        if self.collector.absorb(pin, fin)? {
            output.fin(self.collector.finish(self.profile.finish()))?;
        } else {
            debug!(operator = %self.id, "Input pin {} finished", pin);
        }
        Ok(())
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
