//! Adapter between one local kernel channel and the connections sharing it.

use indexmap::IndexMap;
use kernel_channel::{KernelHandle, KernelId, KernelOutput};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer_codec;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::metrics::BridgeMetrics;
use crate::protocol::{OutboundEvent, close_code};
use crate::session_translator::SessionTranslator;

/// Where events for one connection are delivered
pub type EventSink = mpsc::Sender<OutboundEvent>;

/// Kernel output a connection may have queued before it is cut off
pub const DELIVERY_BACKLOG: usize = 256;

/// Delivery queue of one connection, drained into its sink by a task of its
/// own so a surface that stops reading only ever stalls itself.
struct Outlet {
    /// `None` once the connection has been cut off
    queue: Option<mpsc::Sender<OutboundEvent>>,
    /// Final event, delivered after whatever is still queued
    farewell: Option<oneshot::Sender<OutboundEvent>>,
    forwarder: JoinHandle<()>,
}

impl Outlet {
    fn open(sink: EventSink) -> Self {
        let (queue, mut queue_rx) = mpsc::channel(DELIVERY_BACKLOG);
        let (farewell, farewell_rx) = oneshot::channel();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                if sink.send(event).await.is_err() {
                    return;
                }
            }
            if let Ok(event) = farewell_rx.await {
                let _ = sink.send(event).await;
            }
        });
        Self {
            queue: Some(queue),
            farewell: Some(farewell),
            forwarder,
        }
    }

    fn is_live(&self) -> bool {
        self.queue.is_some()
    }

    fn try_send(&self, event: OutboundEvent) -> std::result::Result<(), TrySendError<OutboundEvent>> {
        match &self.queue {
            Some(queue) => queue.try_send(event),
            None => Err(TrySendError::Closed(event)),
        }
    }

    /// Stop accepting output; `closed` follows whatever is already queued
    fn cut_off(&mut self, closed: OutboundEvent) {
        self.queue = None;
        if let Some(farewell) = self.farewell.take() {
            let _ = farewell.send(closed);
        }
    }

    /// Drop queued output undelivered
    fn abort(self) {
        self.forwarder.abort();
    }
}

/// Mutable state of one channel, behind the channel's own lock
#[derive(Default)]
struct ChannelState {
    translator: SessionTranslator,
    /// Attached connections, in attach order
    outlets: IndexMap<String, Outlet>,
}

/// Binds a kernel handle to the connections multiplexed onto it.
///
/// Owns the only subscription to the kernel's output for as long as it
/// lives. `close` detaches it; the kernel process keeps running. The adapter
/// closes itself when the kernel exits.
pub struct LocalKernelAdapter {
    kernel_id: KernelId,
    handle: KernelHandle,
    state: Arc<Mutex<ChannelState>>,
    cancel: CancellationToken,
    metrics: Arc<BridgeMetrics>,
}

impl std::fmt::Debug for LocalKernelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKernelAdapter")
            .field("kernel_id", &self.kernel_id)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl LocalKernelAdapter {
    /// Subscribe to the kernel's output and start delivering it
    pub fn new(kernel_id: KernelId, handle: KernelHandle, metrics: Arc<BridgeMetrics>) -> Self {
        let state = Arc::new(Mutex::new(ChannelState::default()));
        let cancel = CancellationToken::new();

        let pump = OutputPump {
            kernel_id: kernel_id.clone(),
            output_rx: handle.subscribe(),
            state: state.clone(),
            cancel: cancel.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(pump.run());

        Self {
            kernel_id,
            handle,
            state,
            cancel,
            metrics,
        }
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    pub fn handle(&self) -> &KernelHandle {
        &self.handle
    }

    /// Start delivering kernel output to a connection
    pub async fn attach(&self, connection_id: &str, sink: EventSink) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state
            .outlets
            .insert(connection_id.to_string(), Outlet::open(sink))
        {
            previous.abort();
        }
        debug!(kernel_id = %self.kernel_id, connection_id, "Connection attached");
    }

    /// Stop delivering to a connection and forget its requests.
    ///
    /// Output still queued for it is dropped.
    pub async fn detach(&self, connection_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(outlet) = state.outlets.shift_remove(connection_id) {
            outlet.abort();
        }
        state.translator.forget_connection(connection_id);
        debug!(kernel_id = %self.kernel_id, connection_id, "Connection detached");
    }

    /// Forward a client envelope to the kernel.
    ///
    /// The envelope is written verbatim; only its issuer is recorded.
    pub async fn send(&self, connection_id: &str, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_json()?;
        {
            let mut state = self.state.lock().await;
            if !state.outlets.contains_key(connection_id) {
                return Err(BridgeError::SendFailure(format!(
                    "connection {} is not attached to kernel {}",
                    connection_id, self.kernel_id
                )));
            }
            state.translator.record_request(connection_id, envelope);
        }

        if let Err(e) = self.handle.send_frame(frame).await {
            self.metrics.send_failure();
            warn!(
                kernel_id = %self.kernel_id,
                connection_id,
                msg_id = envelope.msg_id(),
                "Kernel rejected frame: {}",
                e
            );
            return Err(BridgeError::SendFailure(e.to_string()));
        }

        self.metrics.envelope_to_kernel();
        debug!(
            kernel_id = %self.kernel_id,
            connection_id,
            msg_id = envelope.msg_id(),
            msg_type = %envelope.header.msg_type,
            "Forwarded envelope to kernel"
        );
        Ok(())
    }

    /// Attached connection ids, in attach order
    pub async fn connections(&self) -> Vec<String> {
        self.state.lock().await.outlets.keys().cloned().collect()
    }

    /// Stop the output pump. Does not touch the kernel process.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Closed explicitly or because the kernel went away
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for LocalKernelAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct OutputPump {
    kernel_id: KernelId,
    output_rx: broadcast::Receiver<KernelOutput>,
    state: Arc<Mutex<ChannelState>>,
    cancel: CancellationToken,
    metrics: Arc<BridgeMetrics>,
}

impl OutputPump {
    async fn run(mut self) {
        debug!(kernel_id = %self.kernel_id, "Output pump started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                output = self.output_rx.recv() => match output {
                    Ok(KernelOutput::Frame { data, .. }) => self.deliver(&data).await,
                    Ok(KernelOutput::Exited { exit_code }) => {
                        info!(kernel_id = %self.kernel_id, "Kernel exited (code {:?})", exit_code);
                        self.announce_exit().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(kernel_id = %self.kernel_id, "Output pump lagged, {} frames lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.announce_exit().await;
                        break;
                    }
                },
            }
        }
        debug!(kernel_id = %self.kernel_id, "Output pump stopped");
    }

    /// Queue one kernel frame for its recipients. Never waits on a recipient.
    async fn deliver(&self, frame: &str) {
        let mut envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.malformed_envelope();
                warn!(kernel_id = %self.kernel_id, "Dropping kernel frame: {}", e);
                return;
            }
        };
        buffer_codec::normalize_envelope(&mut envelope);

        let mut state = self.state.lock().await;
        let connections: Vec<String> = state
            .outlets
            .iter()
            .filter(|(_, outlet)| outlet.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        let deliveries = state.translator.translate(envelope, &connections);

        let mut delivered = 0;
        for (connection_id, envelope) in deliveries {
            let Some(outlet) = state.outlets.get_mut(&connection_id) else {
                continue;
            };
            let event = OutboundEvent::Message {
                connection_id: connection_id.clone(),
                payload: envelope.to_value(),
            };
            match outlet.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.connection_cut_off();
                    warn!(
                        kernel_id = %self.kernel_id,
                        connection_id = %connection_id,
                        "Connection fell {} messages behind, closing it",
                        DELIVERY_BACKLOG
                    );
                    outlet.cut_off(OutboundEvent::Closed {
                        connection_id,
                        code: close_code::TRY_AGAIN_LATER,
                        reason: "connection fell behind kernel output".to_string(),
                    });
                }
                // The surface is gone; it releases the connection on its own
                Err(TrySendError::Closed(_)) => outlet.queue = None,
            }
        }
        self.metrics.envelopes_from_kernel(delivered);
    }

    /// Close every attached connection and mark the adapter closed
    async fn announce_exit(&self) {
        let mut state = self.state.lock().await;
        for (connection_id, outlet) in state.outlets.iter_mut() {
            if outlet.is_live() {
                outlet.cut_off(OutboundEvent::Closed {
                    connection_id: connection_id.clone(),
                    code: close_code::INTERNAL_ERROR,
                    reason: "kernel exited".to_string(),
                });
            }
        }
        self.cancel.cancel();
    }
}
