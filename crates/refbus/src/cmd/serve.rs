use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use refbus_inject::{register_all, Descriptor, ServiceMap};
use refbus_rpc::{Broker, BrokerConfig, HookService, MessageHub, Service, BROKER_ID, HOOK_SERVICE_ID};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{inject_error, rpc_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;
use crate::services::{LogService, PreferenceService};

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let hello_timeout = parse_duration(&args.hello_timeout)?;

    let hub = MessageHub::new(BROKER_ID);
    let services = build_services()
        .map_err(|err| inject_error("service graph construction failed", err))?;

    let preference = services
        .get::<PreferenceService>("preference")
        .map_err(|err| inject_error("preference lookup failed", err))?;
    let log = services
        .get::<LogService>("log")
        .map_err(|err| inject_error("log lookup failed", err))?;
    hub.expose("preference", preference as Arc<dyn Service>);
    hub.expose("log", log as Arc<dyn Service>);
    hub.expose(HOOK_SERVICE_ID, HookService::new(&hub) as Arc<dyn Service>);

    let config = BrokerConfig {
        hello_timeout,
        ..BrokerConfig::at_dir(&args.runtime_dir)
    };
    let broker = Broker::bind(Arc::clone(&hub), config)
        .map_err(|err| rpc_error("broker bind failed", err))?;
    eprintln!("refbus broker listening on {}", broker.socket_path().display());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    broker.run(&running);
    hub.shutdown();
    Ok(SUCCESS)
}

/// The broker's service graph: preferences first, then the log sink that
/// reads them.
fn build_services() -> refbus_inject::Result<ServiceMap> {
    register_all(vec![
        Descriptor::new("preference", || Ok(PreferenceService::new()?)),
        Descriptor::with_dependencies("log", &["preference"], |map| {
            Ok(LogService::new(map.get::<PreferenceService>("preference")?))
        }),
    ])
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_graph_builds_in_dependency_order() {
        let services = build_services().expect("graph should be acyclic");
        assert_eq!(services.build_order(), ["preference", "log"]);
        assert!(services.get::<LogService>("log").is_ok());
    }
}
