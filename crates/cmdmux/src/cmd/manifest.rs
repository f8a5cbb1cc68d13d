use std::time::Duration;

use cmdmux_proto::{Endpoint, EndpointConfig};
use cmdmux_transport::UnixDomainSocket;

use crate::cmd::ManifestArgs;
use crate::exit::{proto_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_manifest, OutputFormat};

pub fn run(args: ManifestArgs, format: OutputFormat) -> CliResult<i32> {
    let stream = UnixDomainSocket::connect(&args.path)
        .map_err(|err| transport_error("connect failed", err))?;
    let reader = stream
        .try_clone()
        .map_err(|err| transport_error("stream split failed", err))?;

    let endpoint = Endpoint::new(reader, stream, EndpointConfig::named("cmdmux-cli"))
        .map_err(|err| proto_error("endpoint failed", err))?;

    let manifest = endpoint
        .ready_timeout(Duration::from_secs(args.timeout))
        .map_err(|err| proto_error("no manifest", err))?;
    print_manifest(&manifest, format);
    Ok(SUCCESS)
}
