//! The per-channel protocol engine.
//!
//! One [`RpcEngine`] owns one channel to one counterpart process. A pump
//! thread reads frames and dispatches by lane: calls are executed against
//! the shared service table and answered with exactly one reply; replies
//! are correlated through the pending-call table; events invoke locally
//! registered listeners; announcements land in the [`ApiLedger`]; control
//! messages are answered (ping) or handed to the installed handler.
//!
//! Dispatch is FIFO within the channel. When the channel dies, every
//! pending call is rejected with `ChannelClosed` and the close callback
//! removes the engine from its registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use refbus_frame::{lane, FrameConfig, FrameError, FrameReader, FrameWriter};
use refbus_transport::IpcStream;

use crate::control::ControlMessage;
use crate::envelope::{
    CallEnvelope, DescriptorKind, ErrorDescriptor, EventEnvelope, ExposeEnvelope, ReplyEnvelope,
};
use crate::error::{Result, RpcError};
use crate::expose::ApiLedger;
use crate::registry::Handle;
use crate::service::{ServiceError, SharedServices};

/// Method name the engine intercepts to serve remote `already` snapshots.
///
/// Never listed in a service's announced methods.
pub(crate) const META_STATE: &str = "__state__";

/// Handler for control messages the engine does not answer itself.
pub type ControlHandler = Arc<dyn Fn(&str, ControlMessage) + Send + Sync>;

type CloseCallback = Box<dyn FnOnce(&str) + Send>;
type ReplyOutcome = std::result::Result<ReplyEnvelope, RpcError>;
type ReplySender = mpsc::Sender<ReplyOutcome>;
type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct EventListenerEntry {
    id: u64,
    callback: EventCallback,
}

/// Tunables shared by every engine a hub creates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied by `Proxy::call` and `PendingReply::wait_default`.
    pub default_timeout: Duration,
    /// Poll interval for `wait_for_api`.
    pub poll_interval: Duration,
    /// Maximum frame payload size.
    pub max_payload_size: usize,
    /// Maximum wait per hook callback before the pipeline proceeds.
    pub hook_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            max_payload_size: refbus_frame::DEFAULT_MAX_PAYLOAD,
            hook_timeout: Duration::from_secs(2),
        }
    }
}

/// Protocol engine for one channel.
pub struct RpcEngine {
    counterpart_id: String,
    config: EngineConfig,
    writer: Mutex<FrameWriter<IpcStream>>,
    /// Clone of the stream kept for shutdown, which unblocks the pump.
    shutdown_stream: IpcStream,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<u64, ReplySender>>,
    listeners: Mutex<HashMap<String, Vec<EventListenerEntry>>>,
    next_listener_id: AtomicU64,
    ledger: ApiLedger,
    services: SharedServices,
    control_handler: Mutex<Option<ControlHandler>>,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl RpcEngine {
    /// Take ownership of a connected stream and start the pump thread.
    pub fn start(
        counterpart_id: impl Into<String>,
        stream: IpcStream,
        services: SharedServices,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let counterpart_id = counterpart_id.into();
        let reader_stream = stream.try_clone()?;
        let shutdown_stream = stream.try_clone()?;

        let frame_config = FrameConfig {
            max_payload_size: config.max_payload_size,
            read_timeout: None,
            write_timeout: None,
        };
        let writer = FrameWriter::with_config_ipc(stream, frame_config.clone())?;
        let reader = FrameReader::with_config_ipc(reader_stream, frame_config)?;

        let engine = Arc::new(Self {
            counterpart_id: counterpart_id.clone(),
            config,
            writer: Mutex::new(writer),
            shutdown_stream,
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            ledger: ApiLedger::new(),
            services,
            control_handler: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let pump = Arc::clone(&engine);
        std::thread::Builder::new()
            .name(format!("refbus-pump-{counterpart_id}"))
            .spawn(move || pump.pump(reader))
            .map_err(|err| RpcError::Transport(refbus_transport::TransportError::Io(err)))?;

        Ok(engine)
    }

    /// The logical id of the remote counterpart.
    pub fn counterpart_id(&self) -> &str {
        &self.counterpart_id
    }

    /// The counterpart's announced namespaces.
    pub fn ledger(&self) -> &ApiLedger {
        &self.ledger
    }

    /// Whether the channel has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Engine tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of calls awaiting a reply. Empty after teardown.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Install the handler for broker/port control messages.
    pub fn set_control_handler(&self, handler: ControlHandler) {
        *lock(&self.control_handler) = Some(handler);
    }

    /// Install a callback invoked once when the channel is torn down.
    pub fn set_on_close(&self, callback: CloseCallback) {
        *lock(&self.on_close) = Some(callback);
    }

    /// Send a call envelope and return a handle to its eventual reply.
    ///
    /// Never blocks: the reply is awaited through [`PendingReply::wait`].
    /// Fails immediately with `ChannelClosed` if the channel is already
    /// down.
    pub fn invoke(
        self: &Arc<Self>,
        rpc_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<PendingReply> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.lock_pending().insert(call_id, tx);

        let envelope = CallEnvelope {
            call_id,
            rpc_id: rpc_id.to_string(),
            method: method.to_string(),
            args,
        };
        if let Err(err) = self.write(lane::CALL, &envelope) {
            self.lock_pending().remove(&call_id);
            return Err(err);
        }
        trace!(counterpart = %self.counterpart_id, call_id, rpc_id, method, "call sent");

        Ok(PendingReply {
            call_id,
            rpc_id: envelope.rpc_id,
            method: envelope.method,
            rx,
            engine: Arc::downgrade(self),
            default_timeout: self.config.default_timeout,
        })
    }

    /// Register a callback for inbound event envelopes with this signal.
    ///
    /// The first registration of a signal creates its listening slot;
    /// duplicates reuse it. The returned subscription removes exactly this
    /// registration.
    pub fn on_event<F>(self: &Arc<Self>, signal: impl Into<String>, callback: F) -> EventSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let signal = signal.into();
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = lock(&self.listeners);
            let slot = listeners.entry(signal.clone()).or_insert_with(|| {
                debug!(counterpart = %self.counterpart_id, %signal, "listening for signal");
                Vec::new()
            });
            slot.push(EventListenerEntry {
                id,
                callback: Arc::new(callback),
            });
        }
        EventSubscription {
            engine: Arc::downgrade(self),
            signal,
            id,
        }
    }

    pub(crate) fn remove_event_listener(&self, signal: &str, id: u64) {
        let mut listeners = lock(&self.listeners);
        if let Some(slot) = listeners.get_mut(signal) {
            slot.retain(|entry| entry.id != id);
            if slot.is_empty() {
                listeners.remove(signal);
                debug!(counterpart = %self.counterpart_id, %signal, "stopped listening for signal");
            }
        }
    }

    /// Send an event envelope.
    pub fn send_event(&self, event: &EventEnvelope) -> Result<()> {
        self.write(lane::EVENT, event)
    }

    /// Send an exposed-API announcement.
    pub fn announce(&self, announcement: &ExposeEnvelope) -> Result<()> {
        self.write(lane::EXPOSE, announcement)
    }

    /// Send a control message.
    pub fn send_control(&self, message: &ControlMessage) -> Result<()> {
        self.write(lane::CONTROL, message)
    }

    /// Block until the counterpart announces `namespace`, or the timeout
    /// elapses.
    ///
    /// Returns `false` on timeout or channel death — a degraded-mode
    /// signal, not an error.
    pub fn wait_for_api(&self, namespace: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ledger.has(namespace) {
                return true;
            }
            if self.is_closed() {
                debug!(counterpart = %self.counterpart_id, namespace, "channel closed while waiting for api");
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(counterpart = %self.counterpart_id, namespace, ?timeout, "api announcement did not arrive");
                return false;
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Like [`RpcEngine::wait_for_api`], for callers that cannot degrade.
    pub fn require_api(&self, namespace: &str, timeout: Duration) -> Result<()> {
        if self.wait_for_api(namespace, timeout) {
            Ok(())
        } else {
            Err(RpcError::HandshakeTimeout {
                namespace: namespace.to_string(),
                timeout,
            })
        }
    }

    /// Tear the channel down: reject every pending call, unblock the pump,
    /// and fire the close callback. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.shutdown_stream.shutdown() {
            debug!(counterpart = %self.counterpart_id, %err, "stream shutdown failed");
        }
        self.reject_pending();
        if let Some(callback) = lock(&self.on_close).take() {
            callback(&self.counterpart_id);
        }
        debug!(counterpart = %self.counterpart_id, "channel closed");
    }

    fn reject_pending(&self) {
        let drained: Vec<(u64, ReplySender)> = self.lock_pending().drain().collect();
        for (call_id, sender) in drained {
            trace!(counterpart = %self.counterpart_id, call_id, "rejecting pending call");
            let _ = sender.send(Err(RpcError::ChannelClosed));
        }
    }

    fn abandon(&self, call_id: u64) {
        if self.lock_pending().remove(&call_id).is_some() {
            trace!(counterpart = %self.counterpart_id, call_id, "call abandoned; a late reply will be dropped");
        }
    }

    fn write<T: Serialize>(&self, lane: u16, payload: &T) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let bytes = serde_json::to_vec(payload)?;
        let mut writer = lock(&self.writer);
        writer.send(lane, &bytes)?;
        Ok(())
    }

    fn pump(self: Arc<Self>, mut reader: FrameReader<IpcStream>) {
        loop {
            if self.is_closed() {
                break;
            }
            match reader.read_frame() {
                Ok(frame) => self.dispatch(frame),
                Err(FrameError::ConnectionClosed) => {
                    debug!(counterpart = %self.counterpart_id, "counterpart closed the channel");
                    break;
                }
                Err(err) => {
                    if !self.is_closed() {
                        warn!(counterpart = %self.counterpart_id, %err, "channel read failed");
                    }
                    break;
                }
            }
        }
        self.close();
    }

    fn dispatch(&self, frame: refbus_frame::Frame) {
        match frame.lane {
            lane::CALL => match serde_json::from_slice::<CallEnvelope>(&frame.payload) {
                Ok(call) => self.handle_call(call),
                Err(err) => warn!(counterpart = %self.counterpart_id, %err, "malformed call envelope"),
            },
            lane::REPLY => match serde_json::from_slice::<ReplyEnvelope>(&frame.payload) {
                Ok(reply) => self.handle_reply(reply),
                Err(err) => warn!(counterpart = %self.counterpart_id, %err, "malformed reply envelope"),
            },
            lane::EVENT => match serde_json::from_slice::<EventEnvelope>(&frame.payload) {
                Ok(event) => self.handle_event(event),
                Err(err) => warn!(counterpart = %self.counterpart_id, %err, "malformed event envelope"),
            },
            lane::EXPOSE => match serde_json::from_slice::<ExposeEnvelope>(&frame.payload) {
                Ok(announcement) => {
                    self.ledger.record(announcement.namespace, announcement.methods);
                }
                Err(err) => warn!(counterpart = %self.counterpart_id, %err, "malformed announcement"),
            },
            lane::CONTROL => match serde_json::from_slice::<ControlMessage>(&frame.payload) {
                Ok(message) => self.handle_control(message),
                Err(err) => warn!(counterpart = %self.counterpart_id, %err, "malformed control message"),
            },
            other => {
                warn!(counterpart = %self.counterpart_id, lane = other, "frame on unknown lane dropped");
            }
        }
    }

    fn handle_call(&self, call: CallEnvelope) {
        let reply = self.execute_call(&call);
        if let Err(err) = self.write(lane::REPLY, &reply) {
            warn!(
                counterpart = %self.counterpart_id,
                call_id = call.call_id,
                %err,
                "failed to send reply"
            );
        }
    }

    fn execute_call(&self, call: &CallEnvelope) -> ReplyEnvelope {
        let service = {
            let table = self
                .services
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            table.get(&call.rpc_id).cloned()
        };

        let Some(service) = service else {
            trace!(counterpart = %self.counterpart_id, rpc_id = %call.rpc_id, "call for unknown rpc id");
            return ReplyEnvelope::failure(
                call.call_id,
                ErrorDescriptor::not_found(&call.rpc_id, &call.method),
            );
        };

        if call.method == META_STATE {
            let snapshot: serde_json::Map<String, Value> = service
                .state()
                .map(|store| store.deviations().into_iter().collect())
                .unwrap_or_default();
            return ReplyEnvelope::success(call.call_id, Value::Object(snapshot));
        }

        match service.call(&call.method, &call.args) {
            Ok(value) => ReplyEnvelope::success(call.call_id, value),
            Err(ServiceError::MethodNotFound(_)) => ReplyEnvelope::failure(
                call.call_id,
                ErrorDescriptor::not_found(&call.rpc_id, &call.method),
            ),
            Err(ServiceError::Failed { message, stack }) => {
                debug!(
                    counterpart = %self.counterpart_id,
                    rpc_id = %call.rpc_id,
                    method = %call.method,
                    %message,
                    "handler failed"
                );
                ReplyEnvelope::failure(call.call_id, ErrorDescriptor::remote(message, stack))
            }
        }
    }

    fn handle_reply(&self, reply: ReplyEnvelope) {
        let sender = self.lock_pending().remove(&reply.call_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(reply));
            }
            None => {
                trace!(counterpart = %self.counterpart_id, call_id = reply.call_id, "late reply dropped");
            }
        }
    }

    fn handle_event(&self, event: EventEnvelope) {
        let callbacks: Vec<EventCallback> = {
            let listeners = lock(&self.listeners);
            match listeners.get(&event.signal) {
                Some(slot) => slot.iter().map(|entry| Arc::clone(&entry.callback)).collect(),
                None => Vec::new(),
            }
        };
        trace!(
            counterpart = %self.counterpart_id,
            signal = %event.signal,
            listeners = callbacks.len(),
            "event received"
        );
        for callback in callbacks {
            callback(&event.payload);
        }
    }

    fn handle_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::Ping => {
                if let Err(err) = self.send_control(&ControlMessage::Pong) {
                    debug!(counterpart = %self.counterpart_id, %err, "pong failed");
                }
            }
            ControlMessage::Pong => {
                trace!(counterpart = %self.counterpart_id, "pong received");
            }
            other => {
                let handler = lock(&self.control_handler).clone();
                match handler {
                    Some(handler) => handler(&self.counterpart_id, other),
                    None => {
                        debug!(counterpart = %self.counterpart_id, message = ?other, "unhandled control message");
                    }
                }
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ReplySender>> {
        lock(&self.pending)
    }
}

impl Handle for RpcEngine {
    fn close(&self) {
        RpcEngine::close(self);
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("counterpart_id", &self.counterpart_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to one outstanding call.
///
/// Creation is non-blocking; [`PendingReply::wait`] is the suspension
/// point. Abandoning (timeout) removes the pending-table entry so a late
/// reply is silently dropped.
pub struct PendingReply {
    call_id: u64,
    rpc_id: String,
    method: String,
    rx: mpsc::Receiver<ReplyOutcome>,
    engine: Weak<RpcEngine>,
    default_timeout: Duration,
}

impl PendingReply {
    /// The call id this reply correlates to.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Wait for the reply with the engine's default timeout.
    pub fn wait_default(self) -> Result<Value> {
        let timeout = self.default_timeout;
        self.wait(timeout)
    }

    /// Wait for the reply.
    ///
    /// Maps an `ok=false` reply back into the matching local error; on
    /// timeout the call is abandoned.
    pub fn wait(self, timeout: Duration) -> Result<Value> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(reply)) => {
                if reply.ok {
                    Ok(reply.value)
                } else {
                    Err(self.descriptor_error(reply.error))
                }
            }
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(engine) = self.engine.upgrade() {
                    engine.abandon(self.call_id);
                }
                Err(RpcError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RpcError::ChannelClosed),
        }
    }

    fn descriptor_error(&self, descriptor: Option<ErrorDescriptor>) -> RpcError {
        match descriptor {
            Some(descriptor) if descriptor.kind == DescriptorKind::NotFound => RpcError::NotFound {
                rpc_id: self.rpc_id.clone(),
                method: self.method.clone(),
            },
            Some(descriptor) => RpcError::Remote(descriptor),
            // A failed reply with no descriptor is itself malformed.
            None => RpcError::Remote(ErrorDescriptor::remote("reply carried no error", None)),
        }
    }
}

/// Handle to a registered event listener on a channel.
pub struct EventSubscription {
    engine: Weak<RpcEngine>,
    signal: String,
    id: u64,
}

impl EventSubscription {
    /// The signal this subscription listens for.
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Remove this registration. A no-op if the engine is already gone.
    pub fn unsubscribe(self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_event_listener(&self.signal, self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
