//! Hub-to-hub scenarios over an in-process stream pair.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use refbus_rpc::{MessageHub, RpcError, Service, ServiceError};
use refbus_state::StateStore;
use refbus_transport::IpcStream;

struct LogService {
    store: StateStore,
    messages: Mutex<Vec<String>>,
}

impl LogService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            store: StateStore::new("log"),
            messages: Mutex::new(Vec::new()),
        })
    }
}

impl Service for LogService {
    fn methods(&self) -> Vec<String> {
        vec!["info".to_string(), "echo".to_string()]
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "info" => {
                let message = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::failed("info takes a message string"))?;
                self.messages.lock().unwrap().push(message.to_string());
                Ok(Value::Null)
            }
            "echo" => Ok(Value::Array(args.to_vec())),
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }

    fn state(&self) -> Option<&StateStore> {
        Some(&self.store)
    }
}

fn connected_hubs() -> (Arc<MessageHub>, Arc<MessageHub>) {
    let a = MessageHub::new("process-a");
    let b = MessageHub::new("process-b");
    let (left, right) = IpcStream::pair().unwrap();
    a.attach("process-b", left).unwrap();
    b.attach("process-a", right).unwrap();
    (a, b)
}

#[test]
fn log_info_resolves_within_one_round_trip() {
    let (a, b) = connected_hubs();
    let service = LogService::new();
    a.expose("log", Arc::clone(&service) as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let reply = proxy.call("info", vec![json!("hello")]).unwrap();

    assert_eq!(reply, Value::Null);
    assert_eq!(*service.messages.lock().unwrap(), vec!["hello".to_string()]);
}

#[test]
fn echo_reply_deep_equals_arguments() {
    let (a, b) = connected_hubs();
    a.expose("log", LogService::new() as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let args = vec![
        json!({"title": "Attention Is All You Need", "year": 2017}),
        json!([1, 2, [3, {"nested": null}]]),
        json!("plain"),
    ];
    let reply = proxy.call("echo", args.clone()).unwrap();

    assert_eq!(reply, Value::Array(args));
}

#[test]
fn concurrent_calls_resolve_without_crosstalk() {
    let (a, b) = connected_hubs();
    a.expose("log", LogService::new() as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));

    let handles: Vec<_> = (0..16)
        .map(|index| {
            let proxy = b.proxy("process-a", "log").unwrap();
            std::thread::spawn(move || {
                let reply = proxy.call("echo", vec![json!(index)]).unwrap();
                assert_eq!(reply, json!([index]));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn state_fire_delivers_one_event_per_listening_channel() {
    let (a, b) = connected_hubs();
    let service = LogService::new();
    a.expose("log", Arc::clone(&service) as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = proxy.on_changed("level", move |event| {
        sink.lock().unwrap().push((event.key.clone(), event.value.clone()));
    });

    service.store.fire(json!({"level": "error"})).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while events.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "event not delivered");
        std::thread::sleep(Duration::from_millis(5));
    }

    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1, "exactly one event per fire");
    assert_eq!(seen[0], ("level".to_string(), json!("error")));
}

#[test]
fn suppressed_refire_emits_no_remote_event() {
    let (a, b) = connected_hubs();
    let service = LogService::new();
    a.expose("log", Arc::clone(&service) as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let _sub = proxy.on_changed("level", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.store.fire_if_changed(json!({"level": "warn"})).unwrap();
    service.store.fire_if_changed(json!({"level": "warn"})).unwrap();

    // Flush the channel: a round trip after both fires guarantees any
    // emitted events have been dispatched.
    let _ = proxy.call("echo", vec![]).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn tick_signal_defeats_suppression() {
    let (a, b) = connected_hubs();
    let service = LogService::new();
    a.expose("log", Arc::clone(&service) as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&values);
    let _sub = proxy.on_changed("refreshed", move |event| {
        sink.lock().unwrap().push(event.value.clone());
    });

    service.store.tick("refreshed");
    service.store.tick("refreshed");

    let _ = proxy.call("echo", vec![]).unwrap();
    assert_eq!(*values.lock().unwrap(), vec![json!(1), json!(2)]);
}

#[test]
fn channel_closure_rejects_every_pending_call() {
    let consumer = MessageHub::new("consumer");
    let (left, right) = IpcStream::pair().unwrap();
    let engine = consumer.attach("silent", left).unwrap();

    // The counterpart never answers; its raw stream just sits there.
    let pending: Vec<_> = (0..5)
        .map(|i| engine.invoke("svc", "method", vec![json!(i)]).unwrap())
        .collect();
    assert_eq!(engine.pending_count(), 5);

    drop(right);

    for reply in pending {
        let err = reply.wait(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }
    assert_eq!(engine.pending_count(), 0);

    // The registry entry goes with the channel.
    let deadline = Instant::now() + Duration::from_secs(2);
    while consumer.engine("silent").is_some() {
        assert!(Instant::now() < deadline, "registry entry not removed");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn wait_for_api_times_out_without_throwing() {
    let (_a, b) = connected_hubs();

    let started = Instant::now();
    let announced = b.wait_for_api("process-a", "never-exposed", Duration::from_millis(150));

    assert!(!announced);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn not_found_and_remote_errors_stay_call_local() {
    let (a, b) = connected_hubs();
    a.expose("log", LogService::new() as Arc<dyn Service>);

    assert!(b.wait_for_api("process-a", "log", Duration::from_secs(2)));
    let proxy = b.proxy("process-a", "log").unwrap();

    let err = proxy.call("bogus", vec![]).unwrap_err();
    assert!(matches!(err, RpcError::NotFound { .. }));

    let err = proxy.call("info", vec![json!(42)]).unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));

    // The channel survives both failures.
    let reply = proxy.call("echo", vec![json!("still up")]).unwrap();
    assert_eq!(reply, json!(["still up"]));
}
