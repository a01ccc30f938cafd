//! Result sink for the front-end

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::OperatorId;
use arrow::record_batch::RecordBatch;
use query_core::{tuples_to_record_batch, Schema, Tuple};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub schema: Option<Schema>,
}

/// Rows collected by a sink together with the Fin that terminated them
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub operator_id: OperatorId,
    pub schema: Schema,
    pub rows: Vec<Tuple>,
    pub fin: Option<Fin>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Failure that terminated the stream, if any
    pub fn failure(&self) -> Option<&Failure> {
        self.fin.as_ref().and_then(Fin::failure)
    }

    /// Profiles of every operator the rows passed through
    pub fn profiles(&self) -> &[OperatorProfile] {
        self.fin.as_ref().map(Fin::profiles).unwrap_or(&[])
    }

    /// Convert the rows to an Arrow record batch
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        Ok(tuples_to_record_batch(&self.schema, &self.rows)?)
    }
}

pub struct CollectOperator {
    id: OperatorId,
    config: CollectConfig,
    schema: Schema,
    rows: Vec<Tuple>,
    fin: Option<Fin>,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl CollectOperator {
    pub fn new(id: OperatorId, config: CollectConfig) -> Self {
        Self {
            id,
            config,
            schema: Schema::empty(),
            rows: Vec::new(),
            fin: None,
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Collect.as_str()),
        }
    }

    pub fn take_results(&mut self) -> ResultSet {
        ResultSet {
            operator_id: self.id,
            schema: self.schema.clone(),
            rows: std::mem::take(&mut self.rows),
            fin: self.fin.take(),
        }
    }
}

impl Operator for CollectOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Collect
    }

    fn init(&mut self, _ctx: &OperatorContext) -> Result<()> {
        self.schema = required(&self.config.schema, self.kind(), "schema")?;
        Ok(())
    }

    fn push_tuple(&mut self, _pin: usize, tuple: Tuple, _output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        if tuple.len() != self.schema.len() {
            return Err(DistributedError::Execution(format!(
                "Collected tuple has {} columns, expected {}",
                tuple.len(),
                self.schema.len()
            )));
        }
        self.profile.record_tuple();
        self.rows.push(tuple);
        Ok(true)
    }

    fn fin(&mut self, pin: usize, fin: Fin, _output: &mut Output<'_>) -> Result<()> {
        self.profile.start();
        if self.collector.absorb(pin, fin)? {
            let fin = self.collector.finish(self.profile.finish());
            match fin.failure() {
                Some(failure) => info!(operator = %self.id, "Result stream failed: {}", failure),
                None => info!(operator = %self.id, "Collected {} rows", self.rows.len()),
            }
            self.fin = Some(fin);
        }
        Ok(())
    }

    fn abort(&mut self, failure: &Failure) {
        if self.fin.is_none() {
            self.fin = Some(Fin::WithException(failure.clone()));
        }
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
