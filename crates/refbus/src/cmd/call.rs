use serde_json::Value;

use refbus_rpc::{broker, MessageHub, Proxy, BROKER_ID};

use crate::cmd::{parse_duration, parse_value, process_id_or_default, CallArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let wait_api = parse_duration(&args.wait_api)?;
    let process_id = process_id_or_default(&args.process_id, "call");

    let hub = MessageHub::new(process_id);
    broker::join(&hub, &args.socket).map_err(|err| rpc_error("broker join failed", err))?;

    let engine = if args.to == BROKER_ID {
        hub.engine(BROKER_ID)
            .ok_or_else(|| rpc_error("broker channel lost", refbus_rpc::RpcError::ChannelClosed))?
    } else {
        broker::request_channel(&hub, &args.to, timeout)
            .map_err(|err| rpc_error("channel request failed", err))?
    };

    engine
        .require_api(&args.rpc_id, wait_api)
        .map_err(|err| rpc_error("service not announced", err))?;

    let call_args: Vec<Value> = args.args.iter().map(|raw| parse_value(raw)).collect();
    let proxy = Proxy::new(engine, &args.rpc_id).with_timeout(timeout);
    let value = proxy
        .call(&args.method, call_args)
        .map_err(|err| rpc_error("call failed", err))?;

    print_reply(&args.rpc_id, &args.method, &value, format);
    hub.shutdown();
    Ok(SUCCESS)
}
