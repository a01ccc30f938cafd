//! Send and receive endpoints bound to a channel tag
//!
//! Lifecycle: init -> active -> stop -> close. `stop` only affects what the
//! receiving handler accepts; the terminating Fin is always awaited before a
//! channel is considered done.

use crate::error::{DistributedError, Result};
use crate::fin::Failure;
use crate::network::{write_frame, CONTROL_STOP};
use crate::transport::{ChannelState, TransportService};
use crate::types::Tag;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of handling one inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// More payloads are expected
    Continue,
    /// The payload carried the terminating Fin
    Finished,
}

/// Decode callback of a receive endpoint.
///
/// Runs on the network context. It is the only code crossing from there into
/// the pipeline, and it must do so by enqueueing.
pub trait PayloadHandler: Send + Sync {
    /// Handle one payload. `stopped` tells whether the endpoint was asked to
    /// stop accepting data.
    fn on_payload(&self, payload: &[u8], stopped: bool) -> Result<Delivery>;

    /// The channel failed before delivering its Fin (closed, unreadable or
    /// undecodable). Called at most once.
    fn on_failure(&self, failure: Failure);
}

/// Receiving side of a channel
pub struct ReceiveEndpoint {
    host: String,
    port: u16,
    tag: Tag,
    handler: Arc<dyn PayloadHandler>,
    service: Option<Arc<TransportService>>,
    channel: Option<Arc<ChannelState>>,
    local_addr: Option<SocketAddr>,
}

impl ReceiveEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tag: Tag,
        handler: Arc<dyn PayloadHandler>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tag,
            handler,
            service: None,
            channel: None,
            local_addr: None,
        }
    }

    /// Bind (or reuse) the listener and register the tag
    pub fn init(&mut self, service: &Arc<TransportService>) -> Result<()> {
        let addr = service.listen(&format!("{}:{}", self.host, self.port))?;
        let channel = service.register(self.tag.clone(), self.handler.clone())?;
        self.local_addr = Some(addr);
        self.channel = Some(channel);
        self.service = Some(service.clone());
        debug!(tag = %self.tag, "Receive endpoint registered on {}", addr);
        Ok(())
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting data tuples; the sender is told to stop as well
    pub fn stop(&self) {
        if let Some(channel) = &self.channel {
            if !channel.is_stopped() {
                warn!(tag = %self.tag, "Downstream saturated, stopping receive endpoint");
                channel.stop();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_stopped())
    }

    /// Unregister the tag. Safe to call more than once.
    pub fn close(&mut self) {
        if let (Some(service), Some(_)) = (self.service.take(), self.channel.take()) {
            service.unregister(&self.tag);
            debug!(tag = %self.tag, "Receive endpoint closed");
        }
    }
}

impl Drop for ReceiveEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sending side of a channel
pub struct SendEndpoint {
    tag: Tag,
    addr: String,
    handle: Handle,
    writer: Option<OwnedWriteHalf>,
    stopped: Arc<AtomicBool>,
    control_task: Option<JoinHandle<()>>,
    fin_sent: bool,
    max_message_size: usize,
}

impl SendEndpoint {
    /// Connect to the receiver at `host:port` and perform the tag handshake.
    ///
    /// Must be called from a thread outside the transport runtime.
    pub fn connect(service: &TransportService, host: &str, port: u16, tag: Tag) -> Result<Self> {
        let config = service.config().clone();
        let handle = service.handle();
        let addr = format!("{}:{}", host, port);

        let stream = handle.block_on(async {
            let attempts = config.connect_attempts.max(1);
            let mut last_error = String::new();
            for attempt in 1..=attempts {
                let connect = TcpStream::connect(&addr);
                match tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
                    .await
                {
                    Ok(Ok(stream)) => return Ok(stream),
                    Ok(Err(e)) => last_error = e.to_string(),
                    Err(_) => last_error = "connection timed out".to_string(),
                }
                debug!(tag = %tag, "Connect attempt {}/{} to {} failed: {}", attempt, attempts, addr, last_error);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(config.connect_backoff_ms)).await;
                }
            }
            Err(DistributedError::Initialization(format!(
                "Cannot connect to {}: {}",
                addr, last_error
            )))
        })?;

        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        handle
            .block_on(write_frame(
                &mut writer,
                tag.as_str().as_bytes(),
                config.max_message_size,
            ))
            .map_err(|e| {
                DistributedError::Initialization(format!("Handshake with {} failed: {}", addr, e))
            })?;

        let stopped = Arc::new(AtomicBool::new(false));
        let control_task = {
            let stopped = stopped.clone();
            let tag = tag.clone();
            handle.spawn(async move {
                loop {
                    match reader.read_u8().await {
                        Ok(CONTROL_STOP) => {
                            info!(tag = %tag, "Receiver requested stop");
                            stopped.store(true, Ordering::SeqCst);
                        }
                        Ok(other) => warn!(tag = %tag, "Unknown control byte 0x{:02x}", other),
                        Err(_) => break,
                    }
                }
            })
        };

        debug!(tag = %tag, "Send endpoint connected to {}", addr);
        Ok(Self {
            tag,
            addr,
            handle,
            writer: Some(writer),
            stopped,
            control_task: Some(control_task),
            fin_sent: false,
            max_message_size: config.max_message_size,
        })
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Whether the receiver asked this sender to stop producing data
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// Transmit one payload of data tuples
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.fin_sent {
            return Err(DistributedError::ProtocolViolation(format!(
                "Data sent on channel {} after its Fin",
                self.tag
            )));
        }
        let writer = self.writer.as_mut().ok_or_else(|| {
            DistributedError::Network(format!("Send endpoint for {} is closed", self.tag))
        })?;
        self.handle
            .block_on(write_frame(writer, payload, self.max_message_size))
            .map_err(|e| DistributedError::Network(format!("Send to {} failed: {}", self.addr, e)))
    }

    /// Transmit the final payload, which ends with the terminating Fin
    pub fn send_fin(&mut self, payload: &[u8]) -> Result<()> {
        self.send(payload)?;
        self.fin_sent = true;
        debug!(tag = %self.tag, "Fin sent");
        Ok(())
    }

    /// Release the connection. Closing before the Fin was transmitted is a
    /// protocol violation: the receiver would only learn about it from the
    /// closed connection.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let _ = self.handle.block_on(writer.shutdown());
        drop(writer);
        if let Some(task) = self.control_task.take() {
            task.abort();
        }
        if !self.fin_sent {
            error!(tag = %self.tag, "Send endpoint closed without a terminating Fin");
            return Err(DistributedError::ProtocolViolation(format!(
                "Channel {} closed without a terminating Fin",
                self.tag
            )));
        }
        Ok(())
    }
}

impl Drop for SendEndpoint {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use crate::queue::BoundedQueue;
    use crate::types::{JobId, OperatorId, TaskId};

    /// Records every payload; payloads equal to b"fin" end the channel.
    struct Recorder {
        queue: BoundedQueue<std::result::Result<Vec<u8>, Failure>>,
    }

    impl PayloadHandler for Recorder {
        fn on_payload(&self, payload: &[u8], stopped: bool) -> Result<Delivery> {
            let fin = payload == b"fin";
            if fin || !stopped {
                let _ = self.queue.put(Ok(payload.to_vec()));
            }
            Ok(if fin {
                Delivery::Finished
            } else {
                Delivery::Continue
            })
        }

        fn on_failure(&self, failure: Failure) {
            let _ = self.queue.put(Err(failure));
        }
    }

    fn setup() -> (Arc<TransportService>, Arc<Recorder>, ReceiveEndpoint) {
        let service = Arc::new(TransportService::new(NetworkConfig::default()).unwrap());
        let recorder = Arc::new(Recorder {
            queue: BoundedQueue::with_capacity(16),
        });
        let tag = Tag::new(JobId::new(), TaskId::new(), OperatorId::new());
        let mut endpoint = ReceiveEndpoint::new("127.0.0.1", 0, tag, recorder.clone());
        endpoint.init(&service).unwrap();
        (service, recorder, endpoint)
    }

    #[test]
    fn test_payloads_arrive_in_order() {
        let (service, recorder, endpoint) = setup();
        let port = endpoint.local_addr().unwrap().port();

        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", port, endpoint.tag().clone()).unwrap();
        sender.send(b"one").unwrap();
        sender.send(b"two").unwrap();
        sender.send_fin(b"fin").unwrap();
        sender.close().unwrap();

        assert_eq!(recorder.queue.take(), Some(Ok(b"one".to_vec())));
        assert_eq!(recorder.queue.take(), Some(Ok(b"two".to_vec())));
        assert_eq!(recorder.queue.take(), Some(Ok(b"fin".to_vec())));
    }

    #[test]
    fn test_close_without_fin_is_a_violation_on_both_sides() {
        let (service, recorder, endpoint) = setup();
        let port = endpoint.local_addr().unwrap().port();

        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", port, endpoint.tag().clone()).unwrap();
        sender.send(b"one").unwrap();
        assert!(matches!(
            sender.close(),
            Err(DistributedError::ProtocolViolation(_))
        ));

        assert_eq!(recorder.queue.take(), Some(Ok(b"one".to_vec())));
        let failure = recorder.queue.take().unwrap().unwrap_err();
        assert!(failure.message.contains("closed before end of stream"));
    }

    #[test]
    fn test_data_after_fin_is_rejected_locally() {
        let (service, _recorder, endpoint) = setup();
        let port = endpoint.local_addr().unwrap().port();
        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", port, endpoint.tag().clone()).unwrap();
        sender.send_fin(b"fin").unwrap();
        assert!(sender.send(b"late").is_err());
        sender.close().unwrap();
    }

    #[test]
    fn test_stop_reaches_the_sender() {
        let (service, recorder, endpoint) = setup();
        let port = endpoint.local_addr().unwrap().port();
        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", port, endpoint.tag().clone()).unwrap();

        sender.send(b"one").unwrap();
        assert_eq!(recorder.queue.take(), Some(Ok(b"one".to_vec())));
        endpoint.stop();
        assert!(endpoint.is_stopped());

        let mut sent = 0;
        while !sender.is_stopped() && sent < 200 {
            sender.send(b"more").unwrap();
            sent += 1;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(sender.is_stopped());

        sender.send_fin(b"fin").unwrap();
        sender.close().unwrap();
        // Data sent after stop was dropped by the handler; only the Fin is left.
        assert_eq!(recorder.queue.take(), Some(Ok(b"fin".to_vec())));
    }

    #[test]
    fn test_stop_reaches_an_idle_sender() {
        let (service, recorder, endpoint) = setup();
        let port = endpoint.local_addr().unwrap().port();
        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", port, endpoint.tag().clone()).unwrap();

        sender.send(b"one").unwrap();
        assert_eq!(recorder.queue.take(), Some(Ok(b"one".to_vec())));
        endpoint.stop();

        // Nothing else is sent; the connection must signal on its own.
        let mut waited = 0;
        while !sender.is_stopped() && waited < 200 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert!(sender.is_stopped());

        sender.send_fin(b"fin").unwrap();
        sender.close().unwrap();
        assert_eq!(recorder.queue.take(), Some(Ok(b"fin".to_vec())));
    }

    #[test]
    fn test_sender_connecting_before_registration_waits() {
        let service = Arc::new(TransportService::new(NetworkConfig::default()).unwrap());
        let addr = service.listen("127.0.0.1:0").unwrap();
        let tag = Tag::new(JobId::new(), TaskId::new(), OperatorId::new());

        let mut sender =
            SendEndpoint::connect(&service, "127.0.0.1", addr.port(), tag.clone()).unwrap();
        sender.send(b"early").unwrap();

        let recorder = Arc::new(Recorder {
            queue: BoundedQueue::with_capacity(16),
        });
        let mut endpoint =
            ReceiveEndpoint::new("127.0.0.1", addr.port(), tag, recorder.clone());
        endpoint.init(&service).unwrap();
        assert_eq!(endpoint.local_addr(), Some(addr));

        sender.send_fin(b"fin").unwrap();
        sender.close().unwrap();
        assert_eq!(recorder.queue.take(), Some(Ok(b"early".to_vec())));
        assert_eq!(recorder.queue.take(), Some(Ok(b"fin".to_vec())));
    }

    #[test]
    fn test_connect_to_nothing_fails_with_initialization_error() {
        let config = NetworkConfig {
            connect_attempts: 2,
            connect_backoff_ms: 10,
            ..Default::default()
        };
        let service = TransportService::new(config).unwrap();
        // Reserve a port and release it so nothing listens there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let tag = Tag::new(JobId::new(), TaskId::new(), OperatorId::new());
        assert!(matches!(
            SendEndpoint::connect(&service, "127.0.0.1", port, tag),
            Err(DistributedError::Initialization(_))
        ));
    }
}
