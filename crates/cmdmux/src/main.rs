mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "cmdmux", version, about = "Command RPC multiplexing CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_subcommand() {
        let cli = Cli::try_parse_from([
            "cmdmux",
            "call",
            "/tmp/mux.sock",
            "echo",
            "--args",
            "\"hello\"",
        ])
        .expect("call args should parse");
        assert!(matches!(cli.command, Command::Call(_)));
    }

    #[test]
    fn parses_serve_with_name() {
        let cli = Cli::try_parse_from(["cmdmux", "serve", "/tmp/mux.sock", "--name", "hub"])
            .expect("serve args should parse");
        match cli.command {
            Command::Serve(args) => assert_eq!(args.name, "hub"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_manifest_with_timeout() {
        let cli = Cli::try_parse_from(["cmdmux", "manifest", "/tmp/mux.sock", "--timeout", "3"])
            .expect("manifest args should parse");
        assert!(matches!(cli.command, Command::Manifest(_)));
    }
}
