use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cmdmux_proto::{CommandDescriptor, ConnectionOptions, Router};
use cmdmux_transport::UnixDomainSocket;
use serde_json::json;
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let listener =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let router = Router::new(args.name.clone());
    register_demo_commands(&router)
        .map_err(|err| CliError::new(INTERNAL, format!("registration failed: {err}")))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(path = %args.path.display(), name = %args.name, "serving");

    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                return Err(transport_error("accept failed", err));
            }
        };
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                warn!(%err, "could not split accepted stream");
                continue;
            }
        };
        if let Err(err) = router.connection(reader, stream, ConnectionOptions::default()) {
            warn!(%err, "connection setup failed");
        }
    }

    router.close();
    Ok(SUCCESS)
}

fn register_demo_commands(router: &Router) -> cmdmux_proto::Result<()> {
    router.command("echo", |args, io| {
        let reply = match args {
            serde_json::Value::String(text) => json!(text.to_uppercase()),
            other => other,
        };
        let _ = io.reply(reply);
    })?;

    router.register(
        "reverse",
        CommandDescriptor::handler(|args, io| {
            let text: String = args
                .as_str()
                .unwrap_or_default()
                .chars()
                .rev()
                .collect();
            let _ = io.reply(json!(text));
        })
        .help("reverse a string argument"),
    )?;

    router.register(
        "cat",
        CommandDescriptor::new()
            .streaming()
            .help("copy the data stream back to the caller")
            .oncall(|_args, io| {
                while let Some(payload) = io.recv_data() {
                    if io.data(payload).is_err() {
                        break;
                    }
                }
                let _ = io.fin();
            }),
    )?;

    Ok(())
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
