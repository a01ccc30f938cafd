//! Transport service: listeners, tag routing and per-connection receive loops
//!
//! One service per node. It owns the runtime that performs all network I/O,
//! the bound listeners, and the table routing inbound channels to the receive
//! endpoint registered under their tag. It is handed to operators explicitly
//! through the task context.

use crate::endpoint::{Delivery, PayloadHandler};
use crate::error::{DistributedError, Result};
use crate::fin::Failure;
use crate::network::{read_frame, NetworkConfig, CONTROL_STOP};
use crate::types::Tag;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inbound side of one channel, shared between the receive endpoint and the
/// connection task feeding it.
pub(crate) struct ChannelState {
    tag: Tag,
    handler: Arc<dyn PayloadHandler>,
    stopped: AtomicBool,
    /// Wakes the connection task so STOP goes out without waiting for a frame
    stop_signal: Notify,
    terminated: AtomicBool,
    closed: AtomicBool,
    connected: AtomicBool,
}

impl ChannelState {
    fn new(tag: Tag, handler: Arc<dyn PayloadHandler>) -> Self {
        Self {
            tag,
            handler,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_signal.notify_one();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Hand one payload to the handler. Returns true once the channel has
    /// seen its terminating Fin (or failed) and must not read any further.
    fn deliver(&self, payload: &[u8]) -> bool {
        if self.is_terminated() || self.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.handler.on_payload(payload, self.is_stopped()) {
            Ok(Delivery::Continue) => false,
            Ok(Delivery::Finished) => {
                self.terminated.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!(tag = %self.tag, "Failed to handle payload: {}", e);
                self.fail(format!("channel failed: {}", e));
                true
            }
        }
    }

    /// Terminate the channel with a failure, at most once
    fn fail(&self, message: String) {
        if self.terminated.swap(true, Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.handler
            .on_failure(Failure::new(format!("channel {}", self.tag), message));
    }
}

/// Node-level network service shared by every endpoint on the node
pub struct TransportService {
    runtime: Option<Runtime>,
    handle: Handle,
    config: NetworkConfig,
    listeners: Mutex<HashMap<SocketAddr, JoinHandle<()>>>,
    channels: Arc<DashMap<Tag, Arc<ChannelState>>>,
    registered: Arc<Notify>,
}

impl TransportService {
    /// Create a service with its own multi-threaded I/O runtime
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads.max(2))
            .thread_name("qe-transport")
            .enable_all()
            .build()
            .map_err(|e| {
                DistributedError::Initialization(format!("Cannot start transport runtime: {}", e))
            })?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            config,
            listeners: Mutex::new(HashMap::new()),
            channels: Arc::new(DashMap::new()),
            registered: Arc::new(Notify::new()),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Handle of the I/O runtime
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Bind a listener on `addr`, or reuse the one already bound there.
    /// Port 0 always binds a fresh ephemeral port.
    pub fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let requested = addr
            .to_socket_addrs()
            .map_err(|e| {
                DistributedError::Initialization(format!("Cannot resolve {}: {}", addr, e))
            })?
            .next()
            .ok_or_else(|| {
                DistributedError::Initialization(format!("No address found for {}", addr))
            })?;

        let mut listeners = self.listeners.lock();
        if requested.port() != 0 && listeners.contains_key(&requested) {
            return Ok(requested);
        }

        let std_listener = std::net::TcpListener::bind(requested).map_err(|e| {
            DistributedError::Initialization(format!("Cannot listen on {}: {}", requested, e))
        })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let _guard = self.handle.enter();
        let listener = TcpListener::from_std(std_listener)?;
        let task = self.handle.spawn(accept_loop(
            listener,
            self.channels.clone(),
            self.registered.clone(),
            self.config.max_message_size,
        ));
        listeners.insert(local_addr, task);

        info!("Transport listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Route inbound connections for `tag` to `handler`
    pub(crate) fn register(
        &self,
        tag: Tag,
        handler: Arc<dyn PayloadHandler>,
    ) -> Result<Arc<ChannelState>> {
        use dashmap::mapref::entry::Entry;

        let channel = match self.channels.entry(tag.clone()) {
            Entry::Occupied(_) => {
                return Err(DistributedError::Initialization(format!(
                    "Tag {} is already registered",
                    tag
                )))
            }
            Entry::Vacant(slot) => slot
                .insert(Arc::new(ChannelState::new(tag, handler)))
                .value()
                .clone(),
        };
        self.registered.notify_waiters();
        Ok(channel)
    }

    pub(crate) fn unregister(&self, tag: &Tag) {
        if let Some((_, channel)) = self.channels.remove(tag) {
            channel.close();
        }
    }

    /// Number of registered receive channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Drop for TransportService {
    fn drop(&mut self) {
        for (_, task) in self.listeners.lock().drain() {
            task.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    channels: Arc<DashMap<Tag, Arc<ChannelState>>>,
    registered: Arc<Notify>,
    max_message_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted channel connection from {}", peer);
                tokio::spawn(serve_connection(
                    stream,
                    channels.clone(),
                    registered.clone(),
                    max_message_size,
                ));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    channels: Arc<DashMap<Tag, Arc<ChannelState>>>,
    registered: Arc<Notify>,
    max_message_size: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let tag = match read_frame(&mut reader, max_message_size).await {
        Ok(Some(raw)) => match String::from_utf8(raw) {
            Ok(tag) => Tag::from_wire(tag),
            Err(_) => {
                warn!("Dropping connection with a non UTF-8 tag");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!("Dropping connection without handshake: {}", e);
            return;
        }
    };

    // The sender may be faster than the receiving operator's init; hold the
    // connection (and with it the sender) until the tag is registered.
    let channel = loop {
        let notified = registered.notified();
        if let Some(channel) = channels.get(&tag) {
            break channel.value().clone();
        }
        debug!(tag = %tag, "Waiting for receive endpoint registration");
        notified.await;
    };

    if channel.connected.swap(true, Ordering::SeqCst) {
        warn!(tag = %tag, "Rejecting second connection for an already connected channel");
        return;
    }

    let mut stop_sent = false;
    loop {
        // The pending read survives a stop wakeup; dropping it mid-frame
        // would desynchronize the stream.
        let frame = {
            let read = read_frame(&mut reader, max_message_size);
            tokio::pin!(read);
            loop {
                tokio::select! {
                    frame = &mut read => break frame,
                    _ = channel.stop_signal.notified(), if !stop_sent => {
                        stop_sent = true;
                        send_stop(&mut writer, &tag).await;
                    }
                }
            }
        };
        match frame {
            Ok(Some(payload)) => {
                // The handler may block on a full queue; that is the
                // backpressure path into TCP flow control.
                let finished = tokio::task::block_in_place(|| channel.deliver(&payload));
                if finished {
                    debug!(tag = %tag, "Channel reached end of stream");
                    break;
                }
            }
            Ok(None) => {
                if !channel.is_terminated() {
                    error!(tag = %tag, "Connection closed before end of stream");
                    channel.fail("connection closed before end of stream".to_string());
                }
                break;
            }
            Err(e) => {
                error!(tag = %tag, "Channel read failed: {}", e);
                channel.fail(format!("channel read failed: {}", e));
                break;
            }
        }
    }
}

async fn send_stop(writer: &mut OwnedWriteHalf, tag: &Tag) {
    match writer.write_u8(CONTROL_STOP).await {
        Ok(()) => info!(tag = %tag, "Sent stop signal to sender"),
        Err(e) => warn!(tag = %tag, "Failed to send stop signal: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, OperatorId, TaskId};

    struct NoopHandler;

    impl PayloadHandler for NoopHandler {
        fn on_payload(&self, _payload: &[u8], _stopped: bool) -> Result<Delivery> {
            Ok(Delivery::Continue)
        }

        fn on_failure(&self, _failure: Failure) {}
    }

    fn tag() -> Tag {
        Tag::new(JobId::new(), TaskId::new(), OperatorId::new())
    }

    #[test]
    fn test_listen_reuses_bound_address() {
        let service = TransportService::new(NetworkConfig::default()).unwrap();
        let addr = service.listen("127.0.0.1:0").unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(service.listen(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn test_listen_on_taken_port_fails() {
        let first = TransportService::new(NetworkConfig::default()).unwrap();
        let addr = first.listen("127.0.0.1:0").unwrap();

        let second = TransportService::new(NetworkConfig::default()).unwrap();
        assert!(matches!(
            second.listen(&addr.to_string()),
            Err(DistributedError::Initialization(_))
        ));
    }

    #[test]
    fn test_duplicate_tag_is_rejected() {
        let service = TransportService::new(NetworkConfig::default()).unwrap();
        let tag = tag();
        service.register(tag.clone(), Arc::new(NoopHandler)).unwrap();
        assert!(service.register(tag.clone(), Arc::new(NoopHandler)).is_err());

        service.unregister(&tag);
        assert_eq!(service.channel_count(), 0);
        assert!(service.register(tag, Arc::new(NoopHandler)).is_ok());
    }

    #[test]
    fn test_unresolvable_address() {
        let service = TransportService::new(NetworkConfig::default()).unwrap();
        assert!(service.listen("not an address").is_err());
    }
}
