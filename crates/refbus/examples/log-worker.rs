//! A worker that joins a broker, calls the shared log service, and watches
//! its state events.
//!
//! Run with:
//!   cargo run --example log-worker
//!
//! The broker side runs on a background thread here so the example is
//! self-contained; in a real deployment it would be `refbus serve <dir>`
//! in the main process.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use refbus::rpc::{broker, Broker, BrokerConfig, MessageHub, Service, ServiceError, BROKER_ID};
use refbus::state::StateStore;
use refbus::transport::UnixDomainSocket;

struct LogSink {
    store: StateStore,
}

impl Service for LogSink {
    fn methods(&self) -> Vec<String> {
        vec!["info".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "info" => {
                let message = args.first().and_then(Value::as_str).unwrap_or("");
                eprintln!("[main] log.info: {message}");
                self.store
                    .fire(json!({"message": message}))
                    .map_err(|err| ServiceError::failed(err.to_string()))?;
                Ok(Value::Null)
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }

    fn state(&self) -> Option<&StateStore> {
        Some(&self.store)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("refbus-log-worker-{}", std::process::id()));
    fs::create_dir_all(&dir)?;

    // Main process: expose "log" and accept workers.
    let main_hub = MessageHub::new(BROKER_ID);
    main_hub.expose(
        "log",
        Arc::new(LogSink {
            store: StateStore::new("log"),
        }) as Arc<dyn Service>,
    );
    let broker_handle = Broker::bind(Arc::clone(&main_hub), BrokerConfig::at_dir(&dir))?;
    let socket_path = broker_handle.socket_path().to_path_buf();

    let running = Arc::new(AtomicBool::new(true));
    let accept_flag = Arc::clone(&running);
    let acceptor = thread::spawn(move || broker_handle.run(&accept_flag));

    // Worker process: join, wait for the namespace, call it, watch it.
    let worker = MessageHub::new("worker-feeds");
    let engine = broker::join(&worker, &socket_path)?;
    if !engine.wait_for_api("log", Duration::from_secs(2)) {
        return Err("log service never announced".into());
    }

    let proxy = worker.proxy(BROKER_ID, "log").ok_or("broker channel lost")?;
    let _subscription = proxy.on_changed("message", |event| {
        eprintln!("[worker] observed log.{} = {}", event.key, event.value);
    });

    proxy.call("info", vec![json!("hello from worker-feeds")])?;

    // Give the event envelope time to fan back out to this channel.
    thread::sleep(Duration::from_millis(200));

    running.store(false, Ordering::SeqCst);
    // A throwaway connection unblocks the accept loop so it sees the flag.
    let _ = UnixDomainSocket::connect(&socket_path);
    acceptor.join().expect("acceptor thread should not panic");

    worker.shutdown();
    main_hub.shutdown();
    let _ = fs::remove_dir_all(&dir);
    Ok(())
}
