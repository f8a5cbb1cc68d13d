//! Command registration and dispatch.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::ChannelIo;
use crate::encoding::Encoding;
use crate::error::{ProtoError, Result};
use crate::manifest::{CommandInfo, Mode};

/// Handler invoked with the command's arguments and its channel.
pub type CallHandler = Arc<dyn Fn(Value, ChannelIo) + Send + Sync>;

/// Admission hook: runs before the handler, with the caller's environment.
/// Returning an error destroys the channel and the handler never runs.
pub type OpenHandler =
    Arc<dyn Fn(&Value, &ChannelIo) -> std::result::Result<(), String> + Send + Sync>;

/// Everything one registered command carries.
///
/// Built once at registration; a bare handler function normalizes to an
/// async-mode descriptor with default encodings.
#[derive(Clone, Default)]
pub struct CommandDescriptor {
    mode: Option<Mode>,
    encoding: Option<Encoding>,
    log_encoding: Option<Encoding>,
    help: Option<String>,
    title: Option<String>,
    args: Option<Value>,
    oncall: Option<CallHandler>,
    onopen: Option<OpenHandler>,
}

impl CommandDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for a bare handler function.
    pub fn handler(f: impl Fn(Value, ChannelIo) + Send + Sync + 'static) -> Self {
        Self::default().oncall(f)
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Shorthand for `.mode(Mode::Streaming)`.
    pub fn streaming(self) -> Self {
        self.mode(Mode::Streaming)
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn log_encoding(mut self, encoding: Encoding) -> Self {
        self.log_encoding = Some(encoding);
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn oncall(mut self, f: impl Fn(Value, ChannelIo) + Send + Sync + 'static) -> Self {
        self.oncall = Some(Arc::new(f));
        self
    }

    pub fn onopen(
        mut self,
        f: impl Fn(&Value, &ChannelIo) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.onopen = Some(Arc::new(f));
        self
    }

    pub(crate) fn from_info(info: &CommandInfo) -> Self {
        Self {
            mode: Some(info.mode),
            encoding: info.encoding,
            log_encoding: info.log_encoding,
            help: info.help.clone(),
            title: info.title.clone(),
            args: info.args.clone(),
            oncall: None,
            onopen: None,
        }
    }

    /// Layer this descriptor over service-wide defaults.
    fn merged_over(self, defaults: &Self) -> Self {
        Self {
            mode: self.mode.or(defaults.mode),
            encoding: self.encoding.or(defaults.encoding),
            log_encoding: self.log_encoding.or(defaults.log_encoding),
            help: self.help.or_else(|| defaults.help.clone()),
            title: self.title.or_else(|| defaults.title.clone()),
            args: self.args.or_else(|| defaults.args.clone()),
            oncall: self.oncall.or_else(|| defaults.oncall.clone()),
            onopen: self.onopen.or_else(|| defaults.onopen.clone()),
        }
    }

    pub(crate) fn resolved_mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }

    pub(crate) fn data_encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub(crate) fn diag_encoding(&self) -> Option<Encoding> {
        self.log_encoding
    }

    /// The public projection of this descriptor. Handlers never leak.
    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            mode: self.resolved_mode(),
            encoding: self.encoding,
            log_encoding: self.log_encoding,
            help: self.help.clone(),
            title: self.title.clone(),
            args: self.args.clone(),
        }
    }
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("mode", &self.resolved_mode())
            .field("encoding", &self.encoding)
            .field("log_encoding", &self.log_encoding)
            .field("has_oncall", &self.oncall.is_some())
            .field("has_onopen", &self.onopen.is_some())
            .finish()
    }
}

/// Shared table of registered commands.
///
/// Read-mostly: dispatch and manifest projection take brief read locks, so
/// the registry is safe to share across concurrently dispatching connections.
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, Arc<CommandDescriptor>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a command. Upsert: re-registration under the same name
    /// replaces the previous descriptor.
    pub fn add(&self, name: &str, descriptor: CommandDescriptor) -> Result<()> {
        if descriptor.oncall.is_none() && descriptor.onopen.is_none() {
            return Err(ProtoError::Config(format!(
                "command '{name}' has neither a handler nor an admission hook"
            )));
        }
        self.commands
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Register a bare handler function under `name`.
    pub fn add_handler(
        &self,
        name: &str,
        f: impl Fn(Value, ChannelIo) + Send + Sync + 'static,
    ) -> Result<()> {
        self.add(name, CommandDescriptor::handler(f))
    }

    /// Register a batch of commands.
    pub fn batch(
        &self,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
    ) -> Result<()> {
        for (name, descriptor) in entries {
            self.add(&name, descriptor)?;
        }
        Ok(())
    }

    /// Register every entry as `"@prefix name"`, layering each over
    /// `defaults` (shared admission hook, encodings, and so on).
    pub fn service(
        &self,
        prefix: &str,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
        defaults: CommandDescriptor,
    ) -> Result<()> {
        for (name, descriptor) in entries {
            let scoped = format!("@{prefix} {name}");
            self.add(&scoped, descriptor.merged_over(&defaults))?;
        }
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.commands
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.commands
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Deterministic projection of every command's public metadata.
    pub fn manifest(&self) -> BTreeMap<String, CommandInfo> {
        self.commands
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, descriptor)| (name.clone(), descriptor.info()))
            .collect()
    }

    /// Invoke a command on a freshly opened channel.
    ///
    /// Runs on the connection's reader thread up to the admission hook; the
    /// handler itself gets its own thread so it can block on channel I/O.
    pub(crate) fn dispatch(&self, cmd: &str, args: Value, io: ChannelIo) {
        let Some(descriptor) = self.get(cmd) else {
            debug!(cmd, "dispatch of unknown command");
            io.close(Some(format!("Command not found: {cmd}")));
            return;
        };

        io.channel().set_mode(descriptor.resolved_mode());
        io.channel()
            .set_encodings(descriptor.data_encoding(), descriptor.diag_encoding());

        if let Some(hook) = &descriptor.onopen {
            if let Err(err) = hook(&io.env(), &io) {
                debug!(cmd, error = %err, "admission hook rejected invocation");
                io.close(Some(err));
                return;
            }
        }

        let Some(oncall) = descriptor.oncall.clone() else {
            return;
        };
        let guard = io.clone();
        let spawned = std::thread::Builder::new()
            .name("cmdmux-call".to_string())
            .spawn(move || oncall(args, io));
        if spawned.is_err() {
            warn!(cmd, "failed to spawn handler thread");
            guard.close(Some("handler could not be started".to_string()));
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn registration_without_handlers_is_a_config_error() {
        let registry = CommandRegistry::new();
        let err = registry
            .add("empty", CommandDescriptor::new().help("does nothing"))
            .unwrap_err();
        assert!(matches!(err, ProtoError::Config(_)));
        assert!(!registry.has("empty"));
    }

    #[test]
    fn onopen_only_registration_is_valid() {
        let registry = CommandRegistry::new();
        registry
            .add("gate", CommandDescriptor::new().onopen(|_, _| Ok(())))
            .unwrap();
        assert!(registry.has("gate"));
    }

    #[test]
    fn last_registration_wins() {
        let registry = CommandRegistry::new();
        registry
            .add("cmd", CommandDescriptor::handler(|_, _| {}).help("first"))
            .unwrap();
        registry
            .add("cmd", CommandDescriptor::handler(|_, _| {}).help("second"))
            .unwrap();

        let manifest = registry.manifest();
        assert_eq!(manifest["cmd"].help.as_deref(), Some("second"));
    }

    #[test]
    fn service_scopes_names_and_merges_defaults() {
        let registry = CommandRegistry::new();
        let defaults = CommandDescriptor::new()
            .onopen(|env, _| {
                if env.get("token").is_some() {
                    Ok(())
                } else {
                    Err("missing token".to_string())
                }
            })
            .log_encoding(Encoding::Json);

        registry
            .service(
                "files",
                [
                    ("read".to_string(), CommandDescriptor::handler(|_, _| {})),
                    (
                        "tail".to_string(),
                        CommandDescriptor::handler(|_, _| {}).streaming(),
                    ),
                ],
                defaults,
            )
            .unwrap();

        assert!(registry.has("@files read"));
        assert!(registry.has("@files tail"));
        assert!(registry.get("@files read").unwrap().onopen.is_some());
        assert_eq!(
            registry.get("@files tail").unwrap().resolved_mode(),
            Mode::Streaming
        );
        assert_eq!(
            registry.get("@files read").unwrap().resolved_mode(),
            Mode::Async
        );
    }

    #[test]
    fn entry_fields_override_service_defaults() {
        let registry = CommandRegistry::new();
        let defaults = CommandDescriptor::new().help("default help").oncall(|_, _| {});

        registry
            .service(
                "svc",
                [(
                    "special".to_string(),
                    CommandDescriptor::new().help("own help"),
                )],
                defaults,
            )
            .unwrap();

        let manifest = registry.manifest();
        assert_eq!(manifest["@svc special"].help.as_deref(), Some("own help"));
    }

    #[test]
    fn manifest_is_deterministic_and_handler_free() {
        let registry = CommandRegistry::new();
        registry
            .add("zeta", CommandDescriptor::handler(|_, _| {}))
            .unwrap();
        registry
            .add(
                "alpha",
                CommandDescriptor::handler(|_, _| {})
                    .streaming()
                    .encoding(Encoding::Utf8)
                    .args(json!(["path"])),
            )
            .unwrap();

        let manifest = registry.manifest();
        let names: Vec<&String> = manifest.keys().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(manifest["alpha"].mode, Mode::Streaming);
        assert_eq!(manifest["alpha"].encoding, Some(Encoding::Utf8));

        // The projection serializes cleanly: nothing but metadata in it.
        let wire = serde_json::to_value(&manifest).unwrap();
        assert_eq!(wire["alpha"]["mode"], "streaming");
    }

    #[test]
    fn batch_registers_every_entry() {
        let registry = CommandRegistry::new();
        registry
            .batch([
                ("a".to_string(), CommandDescriptor::handler(|_, _| {})),
                ("b".to_string(), CommandDescriptor::handler(|_, _| {})),
            ])
            .unwrap();
        assert!(registry.has("a"));
        assert!(registry.has("b"));
    }
}
