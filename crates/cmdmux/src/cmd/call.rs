use std::io::Read;
use std::time::Duration;

use cmdmux_proto::{Endpoint, EndpointConfig};
use cmdmux_transport::UnixDomainSocket;
use serde_json::Value;

use crate::cmd::CallArgs;
use crate::exit::{proto_error, transport_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_payload, print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let command_args = parse_json_arg(args.args.as_deref(), "args")?;
    let env = parse_json_arg(args.env.as_deref(), "env")?;
    let timeout = Duration::from_secs(args.timeout);

    let stream = UnixDomainSocket::connect(&args.path)
        .map_err(|err| transport_error("connect failed", err))?;
    let reader = stream
        .try_clone()
        .map_err(|err| transport_error("stream split failed", err))?;

    let mut config = EndpointConfig::named("cmdmux-cli");
    config.manifest_timeout = timeout;
    config.call_timeout = timeout.max(Duration::from_secs(30));
    let endpoint =
        Endpoint::new(reader, stream, config).map_err(|err| proto_error("endpoint failed", err))?;

    if args.stream {
        run_streaming(&endpoint, &args, command_args, env)
    } else {
        let (reply, io) = endpoint
            .call_env(&args.command, command_args, env)
            .map_err(|err| proto_error("call failed", err))?;
        print_reply(&reply, format);
        drain_trailing_data(&io);
        Ok(SUCCESS)
    }
}

fn run_streaming(
    endpoint: &Endpoint,
    args: &CallArgs,
    command_args: Value,
    env: Value,
) -> CliResult<i32> {
    let io = endpoint.call_stream_env(&args.command, command_args, env);
    if let Some(error) = io.terminal_error() {
        return Err(CliError::new(DATA_INVALID, format!("stream failed: {error}")));
    }

    // Feed stdin to the command while printing whatever comes back.
    let writer = io.clone();
    let feeder = std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 8 * 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.data(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = writer.fin();
    });

    while let Some(payload) = io.recv_data() {
        print_payload(&payload);
    }
    let _ = feeder.join();

    match io.remote_error() {
        Some(error) => Err(CliError::new(
            crate::exit::REMOTE_ERROR,
            format!("remote error: {error}"),
        )),
        None => Ok(SUCCESS),
    }
}

/// Trailing data after an async reply is printed until the peer finishes.
fn drain_trailing_data(io: &cmdmux_proto::ChannelIo) {
    while let Ok(Some(payload)) = io.recv_data_timeout(Duration::from_millis(200)) {
        print_payload(&payload);
    }
}

fn parse_json_arg(raw: Option<&str>, what: &str) -> CliResult<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        // A bare word is a convenience for string arguments.
        Err(_) if what == "args" => Ok(Value::String(raw.to_string())),
        Err(err) => Err(CliError::new(
            DATA_INVALID,
            format!("invalid {what} JSON: {err}"),
        )),
    }
}
