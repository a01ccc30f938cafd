//! Send operator: the sink end of a network channel

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::codec::Codec;
use crate::endpoint::SendEndpoint;
use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, FinCollector, OperatorProfile};
use crate::task::Output;
use crate::types::{OperatorId, Tag, TaskId};
use query_core::Tuple;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Tuples buffered before a payload is flushed
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Receive operator a Send operator delivers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTarget {
    pub task_id: TaskId,
    pub operator_id: OperatorId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub schema: Option<query_core::Schema>,
    pub target: Option<SendTarget>,
    pub batch_size: Option<usize>,
}

pub struct SendOperator {
    id: OperatorId,
    config: SendConfig,
    codec: Option<Codec>,
    endpoint: Option<SendEndpoint>,
    batch_size: usize,
    buffer: Vec<Tuple>,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl SendOperator {
    pub fn new(id: OperatorId, config: SendConfig) -> Self {
        Self {
            id,
            config,
            codec: None,
            endpoint: None,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: Vec::new(),
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Send.as_str()),
        }
    }

    fn parts(&mut self) -> Result<(&Codec, &mut SendEndpoint)> {
        match (&self.codec, &mut self.endpoint) {
            (Some(codec), Some(endpoint)) => Ok((codec, endpoint)),
            _ => Err(DistributedError::Execution(
                "Send operator not initialized".to_string(),
            )),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let (codec, endpoint) = self.parts()?;
        let payload = codec.encode_batch(&batch, None)?;
        endpoint.send(&payload)?;
        debug!(operator = %self.id, "Flushed {} tuples", batch.len());
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.endpoint.as_ref().is_some_and(SendEndpoint::is_stopped)
    }
}

impl Operator for SendOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Send
    }

    fn init(&mut self, ctx: &OperatorContext) -> Result<()> {
        let host = required(&self.config.host, self.kind(), "host")?;
        let port = required(&self.config.port, self.kind(), "port")?;
        let schema = required(&self.config.schema, self.kind(), "schema")?;
        let target = required(&self.config.target, self.kind(), "target")?;
        self.batch_size = self.config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let tag = Tag::new(ctx.job_id, target.task_id, target.operator_id);
        let endpoint = SendEndpoint::connect(&ctx.transport, &host, port, tag)?;
        info!(operator = %self.id, "Sending to {}:{} as {}", host, port, endpoint.tag());

        self.codec = Some(Codec::new(schema));
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn push_tuple(&mut self, _pin: usize, tuple: Tuple, _output: &mut Output<'_>) -> Result<bool> {
        self.profile.start();
        if self.is_stopped() {
            return Ok(false);
        }
        self.buffer.push(tuple);
        self.profile.record_tuple();
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(!self.is_stopped())
    }

    /// Remaining tuples and the Fin leave in a single payload
    fn fin(&mut self, pin: usize, fin: Fin, _output: &mut Output<'_>) -> Result<()> {
        self.profile.start();
        if !self.collector.absorb(pin, fin)? {
            return Ok(());
        }
        let fin = self.collector.finish(self.profile.finish());
        if self.is_stopped() && !self.buffer.is_empty() {
            debug!(operator = %self.id, "Dropping {} tuples, receiver stopped", self.buffer.len());
            self.buffer.clear();
        }
        let batch = std::mem::take(&mut self.buffer);
        let (codec, endpoint) = self.parts()?;
        let payload = codec.encode_batch(&batch, Some(&fin))?;
        endpoint.send_fin(&payload)
    }

    fn abort(&mut self, failure: &Failure) {
        self.buffer.clear();
        let id = self.id;
        let Ok((codec, endpoint)) = self.parts() else {
            return;
        };
        if endpoint.fin_sent() {
            return;
        }
        let fin = Fin::WithException(failure.clone());
        match codec
            .encode_batch(&[], Some(&fin))
            .and_then(|payload| endpoint.send_fin(&payload))
        {
            Ok(()) => warn!(operator = %id, "Sent failure downstream: {}", failure),
            Err(e) => error!(operator = %id, "Cannot send failure downstream: {}", e),
        }
    }

    fn destroy(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.close() {
                error!(operator = %self.id, "Closing send endpoint: {}", e);
            }
        }
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
