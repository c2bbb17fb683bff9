//! Full broker flow over real Unix sockets: registration, the port
//! handshake, cross-worker calls, and hook dispatch.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use refbus_rpc::{
    join, request_channel, Broker, BrokerConfig, CallbackTarget, HookService, MessageHub,
    Service, ServiceError, BROKER_ID, HOOK_SERVICE_ID,
};

fn unique_runtime_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "refbus-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

struct EchoService;

impl Service for EchoService {
    fn methods(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "echo" => Ok(Value::Array(args.to_vec())),
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

/// An extension host: prefixes the first argument of each hook run.
struct TaggingExtension;

impl Service for TaggingExtension {
    fn methods(&self) -> Vec<String> {
        vec!["transform".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "transform" => {
                let mut out = args.to_vec();
                if let Some(Value::String(first)) = out.first_mut() {
                    *first = format!("tagged:{first}");
                }
                Ok(Value::Array(out))
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

struct BrokerFixture {
    broker: Arc<Broker>,
    hub: Arc<MessageHub>,
    running: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    dir: PathBuf,
}

impl BrokerFixture {
    fn start(tag: &str) -> Self {
        let dir = unique_runtime_dir(tag);
        let hub = MessageHub::new(BROKER_ID);
        let broker = Broker::bind(Arc::clone(&hub), BrokerConfig::at_dir(&dir)).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let accept_broker = Arc::clone(&broker);
        let accept_running = Arc::clone(&running);
        let accept_thread =
            std::thread::spawn(move || accept_broker.run(&accept_running));

        Self {
            broker,
            hub,
            running,
            accept_thread: Some(accept_thread),
            dir,
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.broker.socket_path().to_path_buf()
    }
}

impl Drop for BrokerFixture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Connect once more to unblock the accept loop.
        let _ = refbus_transport::UnixDomainSocket::connect(self.broker.socket_path());
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        self.hub.shutdown();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn worker_joins_and_calls_a_broker_service() {
    let fixture = BrokerFixture::start("join");
    fixture.hub.expose("echo", Arc::new(EchoService) as Arc<dyn Service>);

    let worker = MessageHub::new("worker-a");
    let engine = join(&worker, fixture.socket_path()).unwrap();

    assert!(engine.wait_for_api("echo", Duration::from_secs(5)));
    let proxy = worker.proxy(BROKER_ID, "echo").unwrap();
    let reply = proxy.call("echo", vec![json!("over-the-broker")]).unwrap();

    assert_eq!(reply, json!(["over-the-broker"]));
    worker.shutdown();
}

#[test]
fn port_handshake_connects_two_workers() {
    let fixture = BrokerFixture::start("ports");

    let worker_a = MessageHub::new("worker-a");
    let worker_b = MessageHub::new("worker-b");
    worker_b.expose("echo", Arc::new(EchoService) as Arc<dyn Service>);

    join(&worker_a, fixture.socket_path()).unwrap();
    join(&worker_b, fixture.socket_path()).unwrap();

    // Give the broker a moment to register both workers.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !(fixture.hub.registry().has("worker-a") && fixture.hub.registry().has("worker-b")) {
        assert!(std::time::Instant::now() < deadline, "workers not registered");
        std::thread::sleep(Duration::from_millis(10));
    }

    let engine = request_channel(&worker_a, "worker-b", Duration::from_secs(5)).unwrap();
    assert!(engine.wait_for_api("echo", Duration::from_secs(5)));

    let proxy = worker_a.proxy("worker-b", "echo").unwrap();
    let reply = proxy.call("echo", vec![json!(1), json!("direct")]).unwrap();
    assert_eq!(reply, json!([1, "direct"]));

    worker_a.shutdown();
    worker_b.shutdown();
}

#[test]
fn request_channel_to_unknown_worker_times_out() {
    let fixture = BrokerFixture::start("unknown");

    let worker = MessageHub::new("worker-a");
    join(&worker, fixture.socket_path()).unwrap();

    let err = request_channel(&worker, "worker-ghost", Duration::from_millis(300)).unwrap_err();
    assert!(matches!(err, refbus_rpc::RpcError::Timeout(_)));
    worker.shutdown();
}

#[test]
fn hook_pipeline_runs_across_processes_with_fallback() {
    let fixture = BrokerFixture::start("hooks");
    let hooks = HookService::new(&fixture.hub);
    fixture
        .hub
        .expose(HOOK_SERVICE_ID, Arc::clone(&hooks) as Arc<dyn Service>);

    // The extension host worker exposes its transform callback.
    let extension_host = MessageHub::new("worker-ext");
    extension_host.expose("ext.tagger", Arc::new(TaggingExtension) as Arc<dyn Service>);
    join(&extension_host, fixture.socket_path()).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !fixture.hub.registry().has("worker-ext") {
        assert!(std::time::Instant::now() < deadline, "extension host not registered");
        std::thread::sleep(Duration::from_millis(10));
    }

    // A healthy hook and one whose process does not exist.
    hooks.hook_register(
        "before_save",
        CallbackTarget {
            extension_id: "ext.tagger".to_string(),
            process_id: "worker-ext".to_string(),
            method: "transform".to_string(),
        },
    );
    hooks.hook_register(
        "before_save",
        CallbackTarget {
            extension_id: "ext.gone".to_string(),
            process_id: "worker-missing".to_string(),
            method: "transform".to_string(),
        },
    );

    let out = hooks.run_hook("before_save", vec![json!("title"), json!(2024)]);

    // The healthy hook transformed; the dead one fell back silently.
    assert_eq!(out, vec![json!("tagged:title"), json!(2024)]);
}

#[test]
fn remote_worker_registers_a_command_by_rpc() {
    let fixture = BrokerFixture::start("commands");
    let hooks = HookService::new(&fixture.hub);
    fixture
        .hub
        .expose(HOOK_SERVICE_ID, Arc::clone(&hooks) as Arc<dyn Service>);

    let worker = MessageHub::new("worker-cmd");
    worker.expose("ext.exporter", Arc::new(EchoService) as Arc<dyn Service>);
    let engine = join(&worker, fixture.socket_path()).unwrap();

    assert!(engine.wait_for_api(HOOK_SERVICE_ID, Duration::from_secs(5)));
    let proxy = worker.proxy(BROKER_ID, HOOK_SERVICE_ID).unwrap();
    proxy
        .call(
            "command_register",
            vec![
                json!("export_bibtex"),
                json!("ext.exporter"),
                json!("worker-cmd"),
                json!("echo"),
            ],
        )
        .unwrap();

    assert!(hooks.has_command("export_bibtex"));

    // Running the command routes back to the worker's exposed service.
    let result = hooks
        .run_command("export_bibtex", vec![json!("item-1")])
        .unwrap();
    assert_eq!(result, json!(["item-1"]));

    worker.shutdown();
}

#[test]
fn broker_event_fanout_reaches_every_worker() {
    use refbus_state::StateStore;

    struct StatusService {
        store: StateStore,
    }

    impl Service for StatusService {
        fn methods(&self) -> Vec<String> {
            vec!["poke".to_string()]
        }

        fn call(&self, _method: &str, _args: &[Value]) -> Result<Value, ServiceError> {
            Ok(Value::Null)
        }

        fn state(&self) -> Option<&StateStore> {
            Some(&self.store)
        }
    }

    let fixture = BrokerFixture::start("fanout");
    let status = Arc::new(StatusService {
        store: StateStore::new("status"),
    });
    fixture
        .hub
        .expose("status", Arc::clone(&status) as Arc<dyn Service>);

    let workers: Vec<Arc<MessageHub>> = (0..2)
        .map(|i| {
            let worker = MessageHub::new(format!("worker-{i}"));
            let engine = join(&worker, fixture.socket_path()).unwrap();
            assert!(engine.wait_for_api("status", Duration::from_secs(5)));
            worker
        })
        .collect();

    let sinks: Vec<Arc<Mutex<Vec<Value>>>> = workers
        .iter()
        .map(|worker| {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let proxy = worker.proxy(BROKER_ID, "status").unwrap();
            // Dropping the subscription handle leaves the listener in
            // place; only an explicit unsubscribe removes it.
            let _ = proxy.on_changed("busy", move |event| {
                sink.lock().unwrap().push(event.value.clone());
            });
            seen
        })
        .collect();

    status.store.fire(json!({"busy": true})).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    for seen in &sinks {
        loop {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "fan-out missed a worker");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*seen.lock().unwrap(), vec![json!(true)]);
    }

    for worker in workers {
        worker.shutdown();
    }
}
