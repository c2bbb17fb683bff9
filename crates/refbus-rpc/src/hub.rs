//! The per-process message hub.
//!
//! One hub per process owns the exposed-service table and one engine per
//! attached channel. Exposing a service registers its methods for remote
//! dispatch, announces the namespace on every channel, and — when the
//! service publishes observable state — fans every fired event out to
//! every attached channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace, warn};

use refbus_state::Subscription;
use refbus_transport::IpcStream;

use crate::engine::{ControlHandler, EngineConfig, RpcEngine};
use crate::envelope::{EventEnvelope, ExposeEnvelope};
use crate::error::{Result, RpcError};
use crate::expose::ExposureState;
use crate::proxy::Proxy;
use crate::registry::ProcessRegistry;
use crate::service::{Service, SharedServices};

/// Owns a process's exposed services and its channels to other processes.
pub struct MessageHub {
    process_id: String,
    config: EngineConfig,
    services: SharedServices,
    registry: ProcessRegistry<RpcEngine>,
    control_handler: Mutex<Option<ControlHandler>>,
    state_subscriptions: Mutex<Vec<Subscription>>,
    exposure: Mutex<HashMap<String, ExposureState>>,
}

impl MessageHub {
    /// Create a hub for this process.
    pub fn new(process_id: impl Into<String>) -> Arc<Self> {
        Self::with_config(process_id, EngineConfig::default())
    }

    /// Create a hub with explicit engine tunables.
    pub fn with_config(process_id: impl Into<String>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            process_id: process_id.into(),
            config,
            services: Arc::new(RwLock::new(HashMap::new())),
            registry: ProcessRegistry::new(),
            control_handler: Mutex::new(None),
            state_subscriptions: Mutex::new(Vec::new()),
            exposure: Mutex::new(HashMap::new()),
        })
    }

    /// This process's logical id.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The channel registry, keyed by counterpart id.
    pub fn registry(&self) -> &ProcessRegistry<RpcEngine> {
        &self.registry
    }

    /// Engine tunables used for every attached channel.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Expose a service under a namespace.
    ///
    /// Every method in `Service::methods` becomes remotely callable as
    /// `<rpc_id>.<method>`. If the service publishes observable state, the
    /// hub subscribes to all of its keys and forwards every fired event to
    /// every attached channel. The namespace is announced immediately on
    /// every channel, and re-announced to channels attached later.
    pub fn expose(self: &Arc<Self>, rpc_id: impl Into<String>, service: Arc<dyn Service>) {
        let rpc_id = rpc_id.into();
        let methods = service.methods();

        if let Some(store) = service.state() {
            let hub = Arc::downgrade(self);
            let namespace = rpc_id.clone();
            let subscription = store.on_all(move |event| {
                if let Some(hub) = hub.upgrade() {
                    hub.broadcast_event(&EventEnvelope::for_change(
                        &namespace,
                        &event.key,
                        event.value.clone(),
                    ));
                }
            });
            lock(&self.state_subscriptions).push(subscription);
        }

        {
            let mut table = self
                .services
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if table.insert(rpc_id.clone(), service).is_some() {
                warn!(%rpc_id, "replacing previously exposed service");
            }
        }
        debug!(%rpc_id, methods = methods.len(), "service exposed");

        let announcement = ExposeEnvelope {
            namespace: rpc_id,
            methods,
        };
        for (counterpart_id, engine) in self.registry.all() {
            if let Err(err) = engine.announce(&announcement) {
                warn!(%counterpart_id, %err, "announcement failed");
            }
        }
    }

    /// Attach a connected stream as the channel to `counterpart_id`.
    ///
    /// Starts the channel's engine, installs the hub's control handler,
    /// registers the channel, and announces every currently exposed
    /// namespace to the new counterpart.
    pub fn attach(
        self: &Arc<Self>,
        counterpart_id: impl Into<String>,
        stream: IpcStream,
    ) -> Result<Arc<RpcEngine>> {
        let counterpart_id = counterpart_id.into();
        lock(&self.exposure).insert(counterpart_id.clone(), ExposureState::Unannounced);

        let engine = RpcEngine::start(
            counterpart_id.clone(),
            stream,
            Arc::clone(&self.services),
            self.config.clone(),
        )?;

        if let Some(handler) = lock(&self.control_handler).clone() {
            engine.set_control_handler(handler);
        }
        let hub = Arc::downgrade(self);
        engine.set_on_close(Box::new(move |id: &str| {
            if let Some(hub) = hub.upgrade() {
                // The engine already tore itself down; just drop the entry.
                hub.registry.remove(id);
                lock(&hub.exposure).remove(id);
                trace!(counterpart = %id, "channel removed from registry");
            }
        }));

        self.registry.set(counterpart_id.clone(), Arc::clone(&engine));
        self.announce_all(&counterpart_id, &engine)?;
        Ok(engine)
    }

    fn announce_all(&self, counterpart_id: &str, engine: &RpcEngine) -> Result<()> {
        lock(&self.exposure).insert(counterpart_id.to_string(), ExposureState::Announcing);

        let announcements: Vec<ExposeEnvelope> = {
            let table = self
                .services
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            table
                .iter()
                .map(|(namespace, service)| ExposeEnvelope {
                    namespace: namespace.clone(),
                    methods: service.methods(),
                })
                .collect()
        };
        for announcement in &announcements {
            engine.announce(announcement)?;
        }

        lock(&self.exposure).insert(counterpart_id.to_string(), ExposureState::Ready);
        debug!(
            counterpart = %counterpart_id,
            namespaces = announcements.len(),
            "exposure announcements sent"
        );
        Ok(())
    }

    /// Where the exposure handshake stands for a counterpart.
    pub fn exposure_state(&self, counterpart_id: &str) -> Option<ExposureState> {
        lock(&self.exposure).get(counterpart_id).copied()
    }

    /// The engine for a counterpart, if the channel is up.
    pub fn engine(&self, counterpart_id: &str) -> Option<Arc<RpcEngine>> {
        self.registry.get(counterpart_id)
    }

    /// A proxy for `rpc_id` on the channel to `counterpart_id`.
    pub fn proxy(&self, counterpart_id: &str, rpc_id: &str) -> Option<Proxy> {
        self.engine(counterpart_id)
            .map(|engine| Proxy::new(engine, rpc_id))
    }

    /// A locally exposed service.
    pub fn service(&self, rpc_id: &str) -> Option<Arc<dyn Service>> {
        let table = self
            .services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.get(rpc_id).cloned()
    }

    /// Wait for a counterpart to announce a namespace.
    ///
    /// Returns `false` — degraded mode, never an error — if the channel is
    /// unknown, closes, or the timeout elapses.
    pub fn wait_for_api(
        &self,
        counterpart_id: &str,
        namespace: &str,
        timeout: std::time::Duration,
    ) -> bool {
        match self.engine(counterpart_id) {
            Some(engine) => engine.wait_for_api(namespace, timeout),
            None => {
                debug!(counterpart = %counterpart_id, namespace, "no channel to wait on");
                false
            }
        }
    }

    /// Install the control-message handler for broker/port messages.
    ///
    /// Applied to every already-attached channel and to channels attached
    /// later.
    pub fn set_control_handler(&self, handler: ControlHandler) {
        for (_, engine) in self.registry.all() {
            engine.set_control_handler(Arc::clone(&handler));
        }
        *lock(&self.control_handler) = Some(handler);
    }

    /// Send an event envelope to every attached channel.
    pub fn broadcast_event(&self, event: &EventEnvelope) {
        for (counterpart_id, engine) in self.registry.all() {
            match engine.send_event(event) {
                Ok(()) => {}
                Err(RpcError::ChannelClosed) => {
                    trace!(counterpart = %counterpart_id, "skipping closed channel in fan-out");
                }
                Err(err) => {
                    warn!(counterpart = %counterpart_id, %err, "event fan-out failed");
                }
            }
        }
    }

    /// Tear down the channel to a counterpart.
    pub fn detach(&self, counterpart_id: &str) {
        self.registry.destroy(counterpart_id);
        lock(&self.exposure).remove(counterpart_id);
    }

    /// Tear down every channel and drop all state-event forwarding.
    pub fn shutdown(&self) {
        self.registry.destroy_all();
        lock(&self.exposure).clear();
        for subscription in lock(&self.state_subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        debug!(process = %self.process_id, "hub shut down");
    }
}

impl std::fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHub")
            .field("process_id", &self.process_id)
            .field("channels", &self.registry.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
