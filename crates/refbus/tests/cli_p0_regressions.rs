#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/refbus-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn spawn_serve(dir: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_refbus"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("broker socket never appeared at {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn call(socket: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_refbus"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("raw")
        .arg("call")
        .arg(socket)
        .args(args)
        .output()
        .expect("call should run")
}

#[test]
fn preference_set_then_get_roundtrips_across_processes() {
    let dir = unique_temp_dir("pref");
    let mut serve = spawn_serve(&dir);
    let socket = dir.join("refbus.sock");
    wait_for_socket(&socket, Duration::from_secs(5));

    let set = call(&socket, &["preference", "set", r#"{"theme":"dark"}"#]);
    assert!(
        set.status.success(),
        "set failed: {}",
        String::from_utf8_lossy(&set.stderr)
    );

    let get = call(&socket, &["preference", "get", "theme"]);
    assert!(
        get.status.success(),
        "get failed: {}",
        String::from_utf8_lossy(&get.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&get.stdout).trim(), "dark");

    let _ = serve.kill();
    let _ = serve.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn call_unknown_method_exits_usage() {
    let dir = unique_temp_dir("unknown-method");
    let mut serve = spawn_serve(&dir);
    let socket = dir.join("refbus.sock");
    wait_for_socket(&socket, Duration::from_secs(5));

    let output = call(&socket, &["log", "shout", "too loud"]);
    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("log.shout"), "stderr was: {stderr}");

    let _ = serve.kill();
    let _ = serve.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn watch_receives_log_event_fired_by_another_process() {
    let dir = unique_temp_dir("watch");
    let mut serve = spawn_serve(&dir);
    let socket = dir.join("refbus.sock");
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut watch = Command::new(env!("CARGO_BIN_EXE_refbus"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("raw")
        .arg("watch")
        .arg(&socket)
        .arg("log")
        .arg("message")
        .arg("--count")
        .arg("1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("watch command should start");

    // Let the watcher attach before firing; re-fire periodically in case
    // the first event raced its subscription.
    let deadline = Instant::now() + Duration::from_secs(10);
    thread::sleep(Duration::from_millis(500));
    let exited = loop {
        let fired = call(&socket, &["log", "info", "hello from peer"]);
        assert!(
            fired.status.success(),
            "log call failed: {}",
            String::from_utf8_lossy(&fired.stderr)
        );

        let wait_until = (Instant::now() + Duration::from_secs(2)).min(deadline);
        let mut status = None;
        while Instant::now() < wait_until {
            if let Some(code) = watch.try_wait().expect("try_wait should not fail") {
                status = Some(code);
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        if let Some(status) = status {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = watch.kill();
            panic!("watch never observed the event");
        }
    };

    assert!(exited.success());
    let output = watch.wait_with_output().expect("watch output readable");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("hello from peer"),
        "watch stdout was: {stdout}"
    );

    let _ = serve.kill();
    let _ = serve.wait();
    let _ = std::fs::remove_dir_all(&dir);
}
