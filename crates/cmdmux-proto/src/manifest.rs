//! Manifest types exchanged on the control channel.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoding::Encoding;

/// Invocation style of a command.
///
/// The mode a command is announced with is a contract: invoking it the other
/// way fails locally before any frame is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One request, one reply, optional trailing payload stream.
    #[default]
    Async,
    /// Bidirectional payload stream from the moment of invocation.
    Streaming,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Async => f.write_str("async"),
            Mode::Streaming => f.write_str("streaming"),
        }
    }
}

/// Public metadata one command exposes in a manifest.
///
/// This is a projection: handler references never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(
        rename = "logEncoding",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub log_encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// The Announce payload: one side's advertised command set.
///
/// `commands` is keyed by globally-unique command name; a `BTreeMap` keeps the
/// projection deterministic. Unknown announce fields are preserved in `extra`
/// so announces can carry application metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn manifest_roundtrips_through_json() {
        let mut commands = BTreeMap::new();
        commands.insert(
            "echo".to_string(),
            CommandInfo {
                mode: Mode::Async,
                encoding: None,
                log_encoding: Some(Encoding::Json),
                help: Some("echo args back".to_string()),
                title: None,
                args: Some(json!({"0": "text"})),
            },
        );
        let manifest = Manifest {
            name: Some("echoservice".to_string()),
            commands,
            extra: BTreeMap::new(),
        };

        let wire = serde_json::to_vec(&manifest).unwrap();
        let parsed: Manifest = serde_json::from_slice(&wire).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Streaming).unwrap(), "\"streaming\"");
        let parsed: Mode = serde_json::from_str("\"async\"").unwrap();
        assert_eq!(parsed, Mode::Async);
    }

    #[test]
    fn log_encoding_uses_wire_field_name() {
        let info = CommandInfo {
            mode: Mode::Async,
            encoding: None,
            log_encoding: Some(Encoding::Json),
            help: None,
            title: None,
            args: None,
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["logEncoding"], "json");
        assert!(wire.get("encoding").is_none());
    }

    #[test]
    fn unknown_announce_fields_are_preserved() {
        let wire = json!({
            "name": "peer",
            "commands": {},
            "version": "2.1",
        });
        let parsed: Manifest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.extra["version"], "2.1");

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["version"], "2.1");
    }

    #[test]
    fn missing_optional_fields_default() {
        let parsed: Manifest = serde_json::from_str("{}").unwrap();
        assert!(parsed.name.is_none());
        assert!(parsed.commands.is_empty());
    }
}
