//! The broker control channel and the port handshake.
//!
//! The main process runs a [`Broker`] on a privileged control socket.
//! Workers [`join`] by connecting and sending a `hello` registration;
//! the broker attaches the stream under the announced process id. A worker
//! that wants a private channel to another worker calls
//! [`request_channel`]: the broker allocates a fresh endpoint socket under
//! its runtime directory, tells the destination to bind it, waits for the
//! bind acknowledgement, then hands the endpoint to the requester — so the
//! connect can never race the bind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use refbus_frame::{lane, FrameConfig, FrameReader, FrameWriter};
use refbus_transport::{IpcStream, UnixDomainSocket};

use crate::control::ControlMessage;
use crate::engine::RpcEngine;
use crate::error::{Result, RpcError};
use crate::hub::MessageHub;

/// The broker's logical process id, as seen from every worker.
pub const BROKER_ID: &str = "main";

/// Payload budget for the registration frame, read before the pump starts.
const HELLO_MAX_PAYLOAD: usize = 16 * 1024;

/// Broker tunables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// The privileged control socket workers connect to.
    pub socket_path: PathBuf,
    /// Directory for per-channel endpoint sockets.
    pub runtime_dir: PathBuf,
    /// How long to wait for a worker's `hello` after accept.
    pub hello_timeout: Duration,
}

impl BrokerConfig {
    /// Standard layout under one runtime directory.
    pub fn at_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            socket_path: dir.join("refbus.sock"),
            runtime_dir: dir,
            hello_timeout: Duration::from_secs(5),
        }
    }
}

/// The main process's end of the control channel.
pub struct Broker {
    hub: Arc<MessageHub>,
    socket: UnixDomainSocket,
    runtime_dir: PathBuf,
    hello_timeout: Duration,
    next_endpoint: AtomicU64,
    /// endpoint path → requester id, for in-flight port handshakes.
    pending_ports: Mutex<std::collections::HashMap<String, String>>,
}

impl Broker {
    /// Bind the control socket and take over the hub's control handling.
    pub fn bind(hub: Arc<MessageHub>, config: BrokerConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.runtime_dir)
            .map_err(refbus_transport::TransportError::Io)?;
        let socket = UnixDomainSocket::bind(&config.socket_path)?;

        let broker = Arc::new(Self {
            hub: Arc::clone(&hub),
            socket,
            runtime_dir: config.runtime_dir,
            hello_timeout: config.hello_timeout,
            next_endpoint: AtomicU64::new(1),
            pending_ports: Mutex::new(std::collections::HashMap::new()),
        });

        let routed = Arc::downgrade(&broker);
        hub.set_control_handler(Arc::new(move |from, message| {
            if let Some(broker) = routed.upgrade() {
                broker.handle_control(from, message);
            }
        }));

        info!(socket = ?broker.socket.path(), "broker listening");
        Ok(broker)
    }

    /// The control socket path.
    pub fn socket_path(&self) -> &Path {
        self.socket.path()
    }

    /// Accept one worker: read its `hello`, then attach the channel under
    /// the announced process id.
    pub fn accept_one(&self) -> Result<String> {
        let stream = self.socket.accept()?;
        if let Some((uid, gid, pid)) = stream.peer_credentials() {
            debug!(uid, gid, pid, "worker connected");
        }

        let process_id = read_hello(&stream, self.hello_timeout)?;
        self.hub.attach(&process_id, stream)?;
        info!(worker = %process_id, "worker joined");
        Ok(process_id)
    }

    /// Accept workers until `running` clears.
    ///
    /// Accept and registration failures are logged and do not stop the
    /// loop; only the `running` flag does.
    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            match self.accept_one() {
                Ok(_) => {}
                Err(err) => {
                    if running.load(Ordering::SeqCst) {
                        warn!(%err, "worker registration failed");
                    }
                }
            }
        }
    }

    fn handle_control(&self, from: &str, message: ControlMessage) {
        match message {
            ControlMessage::RequestPort { caller_id } => {
                self.handle_request_port(from, &caller_id);
            }
            ControlMessage::PortReady { endpoint } => {
                self.handle_port_ready(from, &endpoint);
            }
            other => {
                debug!(from, message = ?other, "unhandled control message at broker");
            }
        }
    }

    /// `requester` wants a private channel to `target`.
    fn handle_request_port(&self, requester: &str, target: &str) {
        let Some(destination) = self.hub.engine(target) else {
            warn!(requester, target, "port request for unknown destination");
            if let Some(engine) = self.hub.engine(requester) {
                let _ = engine.send_control(&ControlMessage::PortError {
                    dest_id: target.to_string(),
                    message: "unknown destination".to_string(),
                });
            }
            return;
        };

        let serial = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let endpoint = self
            .runtime_dir
            .join(format!("port-{serial}.sock"))
            .to_string_lossy()
            .into_owned();

        lock(&self.pending_ports).insert(endpoint.clone(), requester.to_string());
        debug!(requester, target, %endpoint, "forwarding port");

        let forward = ControlMessage::ForwardPort {
            caller_id: requester.to_string(),
            dest_id: target.to_string(),
            endpoint: endpoint.clone(),
        };
        if let Err(err) = destination.send_control(&forward) {
            warn!(target, %err, "failed to forward port");
            lock(&self.pending_ports).remove(&endpoint);
        }
    }

    /// The destination bound the endpoint; tell the requester to connect.
    fn handle_port_ready(&self, destination: &str, endpoint: &str) {
        let Some(requester) = lock(&self.pending_ports).remove(endpoint) else {
            warn!(destination, endpoint, "port-ready for unknown endpoint");
            return;
        };
        let Some(engine) = self.hub.engine(&requester) else {
            warn!(%requester, endpoint, "port requester is gone");
            return;
        };
        let response = ControlMessage::ResponsePort {
            endpoint: endpoint.to_string(),
            counterpart_id: destination.to_string(),
        };
        if let Err(err) = engine.send_control(&response) {
            warn!(%requester, %err, "failed to deliver response-port");
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("socket", &self.socket.path())
            .finish()
    }
}

/// Join a broker as a worker.
///
/// Connects to the control socket, registers with a `hello` carrying the
/// hub's process id, attaches the channel under [`BROKER_ID`], and installs
/// the port-handshake handler so this hub can accept forwarded channels.
pub fn join(hub: &Arc<MessageHub>, socket_path: impl AsRef<Path>) -> Result<Arc<RpcEngine>> {
    install_port_handler(hub);

    let stream = UnixDomainSocket::connect(socket_path)?;
    send_hello(&stream, hub.process_id())?;
    let engine = hub.attach(BROKER_ID, stream)?;
    debug!(process = %hub.process_id(), "joined broker");
    Ok(engine)
}

/// Ask the broker for a private channel to `target_id` and wait for it to
/// come up.
pub fn request_channel(
    hub: &Arc<MessageHub>,
    target_id: &str,
    timeout: Duration,
) -> Result<Arc<RpcEngine>> {
    if let Some(engine) = hub.engine(target_id) {
        return Ok(engine);
    }
    let broker = hub.engine(BROKER_ID).ok_or(RpcError::ChannelClosed)?;
    broker.send_control(&ControlMessage::RequestPort {
        caller_id: target_id.to_string(),
    })?;

    let poll = hub.config().poll_interval;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(engine) = hub.engine(target_id) {
            return Ok(engine);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RpcError::Timeout(timeout));
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Install the worker-side handler for the port handshake.
///
/// Idempotent in effect; [`join`] calls it automatically.
pub fn install_port_handler(hub: &Arc<MessageHub>) {
    let weak = Arc::downgrade(hub);
    hub.set_control_handler(Arc::new(move |from, message| {
        let Some(hub) = weak.upgrade() else { return };
        match message {
            ControlMessage::ForwardPort {
                caller_id,
                endpoint,
                ..
            } => {
                accept_forwarded_port(&hub, from, &caller_id, &endpoint);
            }
            ControlMessage::ResponsePort {
                endpoint,
                counterpart_id,
            } => match UnixDomainSocket::connect(&endpoint) {
                Ok(stream) => {
                    if let Err(err) = hub.attach(&counterpart_id, stream) {
                        warn!(counterpart = %counterpart_id, %err, "failed to attach requested channel");
                    }
                }
                Err(err) => {
                    warn!(%endpoint, %err, "failed to connect forwarded endpoint");
                }
            },
            ControlMessage::PortError { dest_id, message } => {
                warn!(dest = %dest_id, %message, "port request failed");
            }
            other => {
                debug!(from, message = ?other, "unhandled control message at worker");
            }
        }
    }));
}

/// Bind a forwarded endpoint, acknowledge it, and accept the requester in
/// the background.
fn accept_forwarded_port(hub: &Arc<MessageHub>, broker_id: &str, caller_id: &str, endpoint: &str) {
    let listener = match UnixDomainSocket::bind(endpoint) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(%endpoint, %err, "failed to bind forwarded endpoint");
            return;
        }
    };

    if let Some(broker) = hub.engine(broker_id) {
        if let Err(err) = broker.send_control(&ControlMessage::PortReady {
            endpoint: endpoint.to_string(),
        }) {
            warn!(%endpoint, %err, "failed to acknowledge forwarded endpoint");
            return;
        }
    }

    let hub = Arc::clone(hub);
    let caller_id = caller_id.to_string();
    std::thread::spawn(move || match listener.accept() {
        Ok(stream) => {
            if let Err(err) = hub.attach(&caller_id, stream) {
                warn!(counterpart = %caller_id, %err, "failed to attach forwarded channel");
            }
        }
        Err(err) => {
            warn!(counterpart = %caller_id, %err, "forwarded endpoint accept failed");
        }
    });
}

fn send_hello(stream: &IpcStream, process_id: &str) -> Result<()> {
    let config = FrameConfig {
        max_payload_size: HELLO_MAX_PAYLOAD,
        read_timeout: None,
        write_timeout: Some(Duration::from_secs(5)),
    };
    let mut writer = FrameWriter::with_config_ipc(stream.try_clone()?, config)?;
    let hello = ControlMessage::Hello {
        process_id: process_id.to_string(),
    };
    writer.send(lane::CONTROL, &serde_json::to_vec(&hello)?)?;
    Ok(())
}

/// Read the registration frame on a freshly accepted stream, with a
/// tighter pre-session payload budget and a deadline.
fn read_hello(stream: &IpcStream, timeout: Duration) -> Result<String> {
    let config = FrameConfig {
        max_payload_size: HELLO_MAX_PAYLOAD,
        read_timeout: Some(timeout),
        write_timeout: None,
    };
    let mut reader = FrameReader::with_config_ipc(stream.try_clone()?, config)?;
    let frame = reader.read_frame()?;
    if frame.lane != lane::CONTROL {
        return Err(RpcError::Registration(format!(
            "expected hello on CONTROL lane, got lane {}",
            frame.lane
        )));
    }
    let message: ControlMessage = serde_json::from_slice(&frame.payload)?;
    match message {
        ControlMessage::Hello { process_id } if !process_id.is_empty() => Ok(process_id),
        ControlMessage::Hello { .. } => {
            Err(RpcError::Registration("empty process id".to_string()))
        }
        other => Err(RpcError::Registration(format!(
            "expected hello, got {other:?}"
        ))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
