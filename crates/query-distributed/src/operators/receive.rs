//! Receive operator: the source end of a network channel
//!
//! Decoded entries travel from the transport runtime to the task's driver
//! thread through a bounded queue. A full queue blocks the decode callback,
//! which stops reading from the socket and lets TCP flow control slow the
//! sender down.

use super::{required, Operator, OperatorContext, OperatorKind};
use crate::codec::{Codec, Message};
use crate::endpoint::{Delivery, PayloadHandler, ReceiveEndpoint};
use crate::error::{DistributedError, Result};
use crate::fin::{Failure, Fin, FinCollector, OperatorProfile};
use crate::queue::{BoundedQueue, DEFAULT_QUEUE_CAPACITY};
use crate::task::Output;
use crate::types::{OperatorId, Tag};
use query_core::Schema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub schema: Option<Schema>,
    pub queue_capacity: Option<usize>,
}

/// Decode callback feeding the receive queue
pub struct ReceiveHandler {
    codec: Codec,
    queue: Arc<BoundedQueue<Message>>,
}

impl ReceiveHandler {
    pub fn new(codec: Codec, queue: Arc<BoundedQueue<Message>>) -> Self {
        Self { codec, queue }
    }
}

impl PayloadHandler for ReceiveHandler {
    fn on_payload(&self, payload: &[u8], stopped: bool) -> Result<Delivery> {
        let messages = self.codec.decode(payload)?;
        let mut delivery = Delivery::Continue;
        for message in messages {
            let is_fin = message.is_fin();
            // Once stopped, only the terminating Fin still goes through.
            if stopped && !is_fin {
                continue;
            }
            self.queue
                .put(message)
                .map_err(|_| DistributedError::QueueClosed)?;
            if is_fin {
                delivery = Delivery::Finished;
            }
        }
        Ok(delivery)
    }

    fn on_failure(&self, failure: Failure) {
        error!("Receive channel failed: {}", failure);
        if self.queue.put(Message::Fin(Fin::WithException(failure))).is_err() {
            debug!("Receive queue already closed, dropping failure");
        }
    }
}

pub struct ReceiveOperator {
    id: OperatorId,
    config: ReceiveConfig,
    queue: Option<Arc<BoundedQueue<Message>>>,
    endpoint: Option<ReceiveEndpoint>,
    collector: FinCollector,
    profile: OperatorProfile,
}

impl ReceiveOperator {
    pub fn new(id: OperatorId, config: ReceiveConfig) -> Self {
        Self {
            id,
            config,
            queue: None,
            endpoint: None,
            collector: FinCollector::new(1),
            profile: OperatorProfile::new(id, OperatorKind::Receive.as_str()),
        }
    }

    /// Tag the channel is registered under, once initialized
    pub fn tag(&self) -> Option<&Tag> {
        self.endpoint.as_ref().map(ReceiveEndpoint::tag)
    }

    fn stop(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.stop();
        }
    }
}

impl Operator for ReceiveOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Receive
    }

    fn inputs(&self) -> usize {
        0
    }

    fn init(&mut self, ctx: &OperatorContext) -> Result<()> {
        let host = required(&self.config.host, self.kind(), "host")?;
        let port = required(&self.config.port, self.kind(), "port")?;
        let schema = required(&self.config.schema, self.kind(), "schema")?;
        let capacity = self.config.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let queue = Arc::new(BoundedQueue::with_capacity(capacity));
        let handler = Arc::new(ReceiveHandler::new(Codec::new(schema), queue.clone()));
        let tag = Tag::new(ctx.job_id, ctx.task_id, ctx.operator_id);
        let mut endpoint = ReceiveEndpoint::new(host, port, tag, handler);
        endpoint.init(&ctx.transport)?;

        self.queue = Some(queue);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Drain the queue into the output until the channel's Fin arrives
    fn push(&mut self, output: &mut Output<'_>) -> Result<bool> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| DistributedError::Execution("Receive operator not initialized".into()))?;

        loop {
            let message = queue.take().ok_or(DistributedError::QueueClosed)?;
            self.profile.start();
            match message {
                Message::Data(tuple) => {
                    self.profile.record_tuple();
                    debug!(operator = %self.id, "Received tuple with {} columns", tuple.len());
                    if !output.push(tuple)? {
                        self.stop();
                    }
                }
                Message::Fin(fin) => {
                    match fin {
                        Fin::Plain => {}
                        Fin::WithProfiles(profiles) => self.collector.merge_profiles(&profiles),
                        Fin::WithException(failure) => {
                            warn!(operator = %self.id, "Upstream failed: {}", failure);
                            self.collector.record_failure(failure);
                        }
                    }
                    return Ok(false);
                }
            }
        }
    }

    /// The driver's Fin is replaced by the received failure, if any
    fn fin(&mut self, pin: usize, fin: Fin, output: &mut Output<'_>) -> Result<()> {
        if self.collector.absorb(pin, fin)? {
            output.fin(self.collector.finish(self.profile.finish()))?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close();
        }
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
    }

    fn profile(&self) -> &OperatorProfile {
        &self.profile
    }
}
