use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod call;
pub mod manifest;
pub mod serve;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve built-in demo commands on a Unix socket.
    Serve(ServeArgs),
    /// Invoke a command on a serving peer.
    Call(CallArgs),
    /// Print the command manifest a peer announces.
    Manifest(ManifestArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Manifest(args) => manifest::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Name announced to connecting peers.
    #[arg(long, default_value = "cmdmux")]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Command name to invoke.
    pub command: String,
    /// Command arguments as JSON (a bare word is taken as a string).
    #[arg(long)]
    pub args: Option<String>,
    /// Caller environment as a JSON object.
    #[arg(long)]
    pub env: Option<String>,
    /// Invoke in streaming mode and copy stdin to the command.
    #[arg(long)]
    pub stream: bool,
    /// Seconds to wait for the peer manifest and the reply.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct ManifestArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Seconds to wait for the peer manifest.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}
