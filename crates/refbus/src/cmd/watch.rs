use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use refbus_rpc::{broker, MessageHub, Proxy, BROKER_ID};

use crate::cmd::{parse_duration, process_id_or_default, WatchArgs};
use crate::exit::{rpc_error, CliError, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_api = parse_duration(&args.wait_api)?;
    let process_id = process_id_or_default(&args.process_id, "watch");

    let hub = MessageHub::new(process_id);
    broker::join(&hub, &args.socket).map_err(|err| rpc_error("broker join failed", err))?;

    let engine = if args.to == BROKER_ID {
        hub.engine(BROKER_ID)
            .ok_or_else(|| rpc_error("broker channel lost", refbus_rpc::RpcError::ChannelClosed))?
    } else {
        broker::request_channel(&hub, &args.to, wait_api)
            .map_err(|err| rpc_error("channel request failed", err))?
    };

    engine
        .require_api(&args.rpc_id, wait_api)
        .map_err(|err| rpc_error("service not announced", err))?;

    let signal = format!("{}.{}", args.rpc_id, args.key);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let printer = {
        let signal = signal.clone();
        let key = args.key.clone();
        move |value: &serde_json::Value| {
            print_event(&signal, &key, value, format);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    };

    let proxy = Proxy::new(engine, &args.rpc_id);
    let _subscription = if args.already {
        proxy
            .already(&args.key, move |event| printer(&event.value))
            .map_err(|err| rpc_error("state snapshot failed", err))?
    } else {
        proxy.on_changed(&args.key, move |event| printer(&event.value))
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        if let Some(count) = args.count {
            if received.load(Ordering::SeqCst) >= count {
                break;
            }
        }
        if hub.engine(&args.to).is_none() {
            // The channel died under us; nothing more will arrive.
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    hub.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
