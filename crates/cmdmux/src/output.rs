use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use cmdmux_proto::{Manifest, Payload};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_reply(reply: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(reply).unwrap_or_else(|_| "null".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => match reply {
            Value::String(text) => println!("{text}"),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).unwrap_or_else(|_| "null".to_string())
            ),
        },
    }
}

pub fn print_payload(payload: &Payload) {
    match payload {
        Payload::Bytes(bytes) => {
            let mut out = std::io::stdout();
            let _ = out.write_all(bytes);
            let _ = out.flush();
        }
        Payload::Json(value) => println!(
            "{}",
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        ),
        Payload::Text(text) => println!("{text}"),
    }
}

pub fn print_manifest(manifest: &Manifest, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(manifest).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COMMAND", "MODE", "ENCODING", "HELP"]);
            for (name, info) in &manifest.commands {
                table.add_row(vec![
                    name.clone(),
                    info.mode.to_string(),
                    info.encoding.map(|e| e.to_string()).unwrap_or_default(),
                    info.help.clone().unwrap_or_default(),
                ]);
            }
            if let Some(name) = &manifest.name {
                println!("peer: {name}");
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            if let Some(name) = &manifest.name {
                println!("peer: {name}");
            }
            for (name, info) in &manifest.commands {
                println!(
                    "{name} [{}]{}",
                    info.mode,
                    info.help
                        .as_deref()
                        .map(|help| format!(": {help}"))
                        .unwrap_or_default()
                );
            }
        }
    }
}
