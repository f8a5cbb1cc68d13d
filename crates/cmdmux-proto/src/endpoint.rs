//! One connection: transport pair + multiplexer + command registry.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cmdmux_wire::{varint, FrameConfig, FrameReader, FrameWriter, MessageType, DEFAULT_MAX_PAYLOAD};
use serde_json::Value;
use tracing::{debug, trace};

use crate::channel::{ChannelIo, FrameSink};
use crate::encoding::Encoding;
use crate::error::{ProtoError, Result};
use crate::manifest::{Manifest, Mode};
use crate::mux::{Multiplexer, MuxHooks};
use crate::registry::{CommandDescriptor, CommandRegistry};

/// Called when a remote manifest arrives (router exposure).
pub(crate) type AnnounceHook = Arc<dyn Fn(&Endpoint, Manifest) + Send + Sync>;

/// Called for control-channel Extension messages.
pub type ExtensionHook = Arc<dyn Fn(u64, Bytes) + Send + Sync>;

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Connection name, used in logs and as the announced peer name.
    pub name: String,
    /// Peer name to announce when it differs from the connection name
    /// (a router announces under its own name on every connection).
    pub announce_name: Option<String>,
    /// How long calls wait for the first remote manifest.
    pub manifest_timeout: Duration,
    /// How long `call` waits for its terminal outcome.
    pub call_timeout: Duration,
    /// Maximum frame payload size for this connection.
    pub max_payload: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            announce_name: None,
            manifest_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl EndpointConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Blocks callers until the first remote manifest arrives.
///
/// All queued waiters resolve together: with the manifest once it lands, or
/// identically with a connection error if the stream dies first.
struct ManifestGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    manifest: Option<Manifest>,
    closed: Option<String>,
}

impl ManifestGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, manifest: Manifest) {
        let mut state = self.state.lock().expect("manifest gate lock poisoned");
        state.manifest = Some(manifest);
        self.cond.notify_all();
    }

    fn close(&self, reason: &str) {
        let mut state = self.state.lock().expect("manifest gate lock poisoned");
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        self.cond.notify_all();
    }

    fn peek(&self) -> Option<Manifest> {
        self.state
            .lock()
            .expect("manifest gate lock poisoned")
            .manifest
            .clone()
    }

    fn wait(&self, timeout: Duration) -> Result<Manifest> {
        let mut state = self.state.lock().expect("manifest gate lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(manifest) = state.manifest.as_ref() {
                return Ok(manifest.clone());
            }
            if let Some(reason) = state.closed.as_ref() {
                return Err(ProtoError::ConnectionClosed(reason.clone()));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(ProtoError::ManifestTimeout(timeout));
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, remaining)
                .expect("manifest gate lock poisoned");
            state = guard;
        }
    }
}

struct EndpointInner {
    config: EndpointConfig,
    registry: Arc<CommandRegistry>,
    mux: Arc<Multiplexer>,
    gate: ManifestGate,
    announced: AtomicBool,
    closed: AtomicBool,
    announce_hook: Option<AnnounceHook>,
    extension_hook: RwLock<Option<ExtensionHook>>,
}

impl EndpointInner {
    fn disconnect(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn = %self.config.name, reason, "connection closed");
        self.gate.close(reason);
        self.mux.destroy_all(reason);
    }
}

/// One side of a connection: exposes local commands to the peer and invokes
/// the peer's commands.
///
/// Cloneable; clones share the connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Stand up an endpoint over a reader/writer pair with its own registry.
    pub fn new<R, W>(reader: R, writer: W, config: EndpointConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::build(reader, writer, config, Arc::new(CommandRegistry::new()), None)
    }

    /// Stand up an endpoint sharing an existing registry.
    pub fn with_registry<R, W>(
        reader: R,
        writer: W,
        config: EndpointConfig,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::build(reader, writer, config, registry, None)
    }

    pub(crate) fn build<R, W>(
        reader: R,
        writer: W,
        config: EndpointConfig,
        registry: Arc<CommandRegistry>,
        announce_hook: Option<AnnounceHook>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let frame_config = FrameConfig {
            max_payload_size: config.max_payload,
        };

        let frame_writer = Arc::new(Mutex::new(FrameWriter::with_config(
            writer,
            frame_config.clone(),
        )));
        let sink: FrameSink = Arc::new(move |channel, kind, payload| {
            frame_writer
                .lock()
                .expect("frame writer lock poisoned")
                .send(channel, kind, payload)
                .map_err(ProtoError::from)
        });

        let inner = Arc::new_cyclic(|weak: &Weak<EndpointInner>| {
            let oncall = {
                let weak = weak.clone();
                Arc::new(move |cmd: String, args: Value, io: ChannelIo| {
                    if let Some(inner) = weak.upgrade() {
                        inner.registry.dispatch(&cmd, args, io);
                    }
                })
            };
            let onannounce = {
                let weak = weak.clone();
                Arc::new(move |manifest: Manifest| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    trace!(conn = %inner.config.name, "remote manifest received");
                    inner.gate.publish(manifest.clone());
                    if let Some(hook) = inner.announce_hook.clone() {
                        hook(&Endpoint { inner }, manifest);
                    }
                })
            };
            let onextension = {
                let weak = weak.clone();
                Arc::new(move |id: u64, payload: Bytes| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let hook = inner
                        .extension_hook
                        .read()
                        .expect("extension hook lock poisoned")
                        .clone();
                    if let Some(hook) = hook {
                        hook(id, payload);
                    }
                })
            };

            let mux = Multiplexer::new(
                config.name.clone(),
                sink,
                MuxHooks {
                    oncall,
                    onannounce,
                    onextension,
                },
            );

            EndpointInner {
                config,
                registry,
                mux,
                gate: ManifestGate::new(),
                announced: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                announce_hook,
                extension_hook: RwLock::new(None),
            }
        });

        let thread_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name(format!("cmdmux-read-{}", inner.config.name))
            .spawn(move || {
                let mut frames = FrameReader::with_config(reader, frame_config);
                loop {
                    if thread_inner.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match frames.read_frame() {
                        Ok(frame) => thread_inner.mux.handle_frame(frame),
                        Err(err) => {
                            thread_inner.disconnect(&err.to_string());
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { inner })
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The registry this endpoint dispatches into.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.inner.registry
    }

    /// Register a bare handler function; re-announces if already announced.
    pub fn command(
        &self,
        name: &str,
        f: impl Fn(Value, ChannelIo) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.registry.add_handler(name, f)?;
        self.reannounce_if_needed()
    }

    /// Register a full descriptor; re-announces if already announced.
    pub fn register(&self, name: &str, descriptor: CommandDescriptor) -> Result<()> {
        self.inner.registry.add(name, descriptor)?;
        self.reannounce_if_needed()
    }

    /// Register a batch of commands; re-announces if already announced.
    pub fn commands(
        &self,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
    ) -> Result<()> {
        self.inner.registry.batch(entries)?;
        self.reannounce_if_needed()
    }

    /// Register a scoped service; re-announces if already announced.
    pub fn service(
        &self,
        prefix: &str,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
        defaults: CommandDescriptor,
    ) -> Result<()> {
        self.inner.registry.service(prefix, entries, defaults)?;
        self.reannounce_if_needed()
    }

    fn reannounce_if_needed(&self) -> Result<()> {
        if self.inner.announced.load(Ordering::SeqCst) {
            self.announce()?;
        }
        Ok(())
    }

    /// Announce this side's manifest on the control channel.
    pub fn announce(&self) -> Result<()> {
        self.announce_with(BTreeMap::new())
    }

    /// Announce with extra application fields spread into the message.
    pub fn announce_with(&self, extra: BTreeMap<String, Value>) -> Result<()> {
        let announced_name = self
            .inner
            .config
            .announce_name
            .clone()
            .unwrap_or_else(|| self.inner.config.name.clone());
        let manifest = Manifest {
            name: Some(announced_name),
            commands: self.inner.registry.manifest(),
            extra,
        };
        let payload = serde_json::to_vec(&manifest)?;
        self.inner.mux.send_control(MessageType::Announce, &payload)?;
        self.inner.announced.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The most recent manifest the peer announced, if any.
    pub fn remote_manifest(&self) -> Option<Manifest> {
        self.inner.gate.peek()
    }

    /// Wait for the peer's manifest using the configured timeout.
    pub fn ready(&self) -> Result<Manifest> {
        self.inner.gate.wait(self.inner.config.manifest_timeout)
    }

    /// Wait for the peer's manifest with an explicit timeout.
    pub fn ready_timeout(&self, timeout: Duration) -> Result<Manifest> {
        self.inner.gate.wait(timeout)
    }

    /// Invoke an async-mode command and wait for its single outcome.
    pub fn call(&self, cmd: &str, args: Value) -> Result<(Value, ChannelIo)> {
        self.call_env(cmd, args, Value::Null)
    }

    /// Invoke an async-mode command with a caller environment.
    pub fn call_env(&self, cmd: &str, args: Value, env: Value) -> Result<(Value, ChannelIo)> {
        let io = self.open_channel(cmd, args, env, Some(Mode::Async))?;
        let value = io.wait_reply(self.inner.config.call_timeout)?;
        Ok((value, io))
    }

    /// Invoke a streaming-mode command; the duplex stream is the payload.
    ///
    /// Precondition failures come back as a dead stream carrying the error,
    /// so stream-style callers always get a stream-shaped result.
    pub fn call_stream(&self, cmd: &str, args: Value) -> ChannelIo {
        self.call_stream_env(cmd, args, Value::Null)
    }

    /// Streaming invocation with a caller environment.
    pub fn call_stream_env(&self, cmd: &str, args: Value, env: Value) -> ChannelIo {
        match self.open_channel(cmd, args, env, Some(Mode::Streaming)) {
            Ok(io) => io,
            Err(err) => ChannelIo::failed(err),
        }
    }

    /// Mode-agnostic invocation used when forwarding on behalf of a caller
    /// whose own channel already passed the mode check.
    pub(crate) fn open_proxy(&self, cmd: &str, args: Value, env: Value) -> Result<ChannelIo> {
        self.open_channel(cmd, args, env, None)
    }

    fn open_channel(
        &self,
        cmd: &str,
        args: Value,
        env: Value,
        requested: Option<Mode>,
    ) -> Result<ChannelIo> {
        // Deferred-call semantics: block here until the manifest lands.
        let manifest = self.inner.gate.wait(self.inner.config.manifest_timeout)?;

        let info = manifest
            .commands
            .get(cmd)
            .ok_or_else(|| ProtoError::CommandNotFound(cmd.to_string()))?;
        if let Some(requested) = requested {
            if info.mode != requested {
                return Err(ProtoError::ModeMismatch {
                    command: cmd.to_string(),
                    registered: info.mode,
                    requested,
                });
            }
        }

        let channel = self.inner.mux.create_local_channel(
            info.mode,
            info.encoding.unwrap_or_default(),
            info.log_encoding.unwrap_or(Encoding::Json),
        );
        let io = ChannelIo::new(channel);
        io.channel().open(env)?;
        io.channel().command(cmd, args)?;
        Ok(io)
    }

    /// Send a control-channel extension message: `varint(id) ++ payload`.
    pub fn send_extension(&self, id: u64, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(payload.len() + 10);
        varint::encode(id, &mut buf);
        buf.extend_from_slice(payload);
        self.inner.mux.send_control(MessageType::Extension, &buf)
    }

    /// Install the handler for incoming extension messages.
    pub fn on_extension(&self, hook: impl Fn(u64, Bytes) + Send + Sync + 'static) {
        *self
            .inner
            .extension_hook
            .write()
            .expect("extension hook lock poisoned") = Some(Arc::new(hook));
    }

    /// Tear down the connection: every open channel fails with a connection
    /// error. Idempotent.
    pub fn close(&self) {
        self.inner.disconnect("endpoint closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use cmdmux_transport::duplex_pair;
    use serde_json::json;

    use super::*;
    use crate::encoding::{Encoding, Payload};

    fn connected_pair(server: &str, client: &str) -> (Endpoint, Endpoint) {
        let (a, b) = duplex_pair();
        let server = Endpoint::new(a.clone(), a, EndpointConfig::named(server))
            .expect("server endpoint should start");
        let client = Endpoint::new(b.clone(), b, EndpointConfig::named(client))
            .expect("client endpoint should start");
        (server, client)
    }

    #[test]
    fn command_round_trip() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("echo", |args, io| {
                let text = args.as_str().unwrap_or_default().to_uppercase();
                let _ = io.reply(json!(text));
            })
            .unwrap();
        server.announce().unwrap();

        let (reply, _io) = client.call("echo", json!("hello world")).unwrap();
        assert_eq!(reply, json!("HELLO WORLD"));
    }

    #[test]
    fn reply_with_trailing_data_stream() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("fetch", |_args, io| {
                let _ = io.reply(json!("ok"));
                let _ = io.data(b"chunk-1".as_slice());
                let _ = io.data(b"chunk-2".as_slice());
                let _ = io.fin();
            })
            .unwrap();
        server.announce().unwrap();

        let (reply, io) = client.call("fetch", Value::Null).unwrap();
        assert_eq!(reply, json!("ok"));
        assert_eq!(io.recv_data(), Some(Payload::Bytes(Bytes::from_static(b"chunk-1"))));
        assert_eq!(io.recv_data(), Some(Payload::Bytes(Bytes::from_static(b"chunk-2"))));
        assert_eq!(io.recv_data(), None);
    }

    #[test]
    fn mode_mismatch_fails_locally() {
        let (server, client) = connected_pair("server", "client");

        server
            .register(
                "tail",
                CommandDescriptor::handler(|_, _| {}).streaming(),
            )
            .unwrap();
        server.announce().unwrap();
        client.ready().unwrap();

        let err = client.call("tail", Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::ModeMismatch { .. }));

        // The reverse direction: async command invoked as a stream.
        server.command("ping", |_, io| { let _ = io.reply(json!("pong")); }).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !client
            .remote_manifest()
            .is_some_and(|m| m.commands.contains_key("ping"))
        {
            assert!(std::time::Instant::now() < deadline, "updated manifest never arrived");
            thread::sleep(Duration::from_millis(10));
        }
        let io = client.call_stream("ping", Value::Null);
        let err = io.wait_reply(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ProtoError::ModeMismatch { .. }));
    }

    #[test]
    fn unknown_command_fails_before_any_frame() {
        let (server, client) = connected_pair("server", "client");
        server.announce().unwrap();
        client.ready().unwrap();

        let err = client.call("missing", Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::CommandNotFound(_)));
    }

    #[test]
    fn calls_queue_until_the_manifest_arrives() {
        let (server, client) = connected_pair("server", "client");
        server
            .command("echo", |args, io| {
                let _ = io.reply(args);
            })
            .unwrap();

        // Issue calls before any announce; they must block, then resolve.
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let client = client.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = client.call("echo", json!(i)).map(|(value, _)| value);
                tx.send((i, result)).expect("result channel should accept");
            });
        }

        thread::sleep(Duration::from_millis(50));
        server.announce().unwrap();

        for _ in 0..3 {
            let (i, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(result.unwrap(), json!(i));
        }
    }

    #[test]
    fn queued_calls_fail_identically_when_the_connection_dies_first() {
        let (a, b) = duplex_pair();
        let client = Endpoint::new(b.clone(), b, EndpointConfig::named("client")).unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let client = client.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(client.call("echo", Value::Null)).expect("send result");
            });
        }

        thread::sleep(Duration::from_millis(50));
        drop(a); // peer side vanishes; reader thread sees EOF

        for _ in 0..2 {
            let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(result, Err(ProtoError::ConnectionClosed(_))));
        }
    }

    #[test]
    fn streaming_command_is_bidirectional() {
        let (server, client) = connected_pair("server", "client");

        server
            .register(
                "shout",
                CommandDescriptor::new().streaming().oncall(|_args, io| {
                    while let Some(payload) = io.recv_data() {
                        let text = payload.to_text().to_uppercase();
                        if io.data(text).is_err() {
                            break;
                        }
                    }
                    let _ = io.fin();
                }),
            )
            .unwrap();
        server.announce().unwrap();

        let io = client.call_stream("shout", Value::Null);
        io.data("first").unwrap();
        io.data("second").unwrap();
        io.fin().unwrap();

        assert_eq!(io.recv_data().unwrap().to_text(), "FIRST");
        assert_eq!(io.recv_data().unwrap().to_text(), "SECOND");
        assert_eq!(io.recv_data(), None);
    }

    #[test]
    fn handler_close_with_error_is_a_remote_error() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("fail", |_args, io| {
                io.close(Some("it broke".to_string()));
            })
            .unwrap();
        server.announce().unwrap();

        let err = client.call("fail", Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::Remote(msg) if msg == "it broke"));
    }

    #[test]
    fn admission_hook_rejection_reaches_the_caller_as_remote_error() {
        let (server, client) = connected_pair("server", "client");
        let (ran_tx, ran_rx) = mpsc::channel::<()>();

        server
            .service(
                "echos",
                [
                    (
                        "loud".to_string(),
                        CommandDescriptor::handler(move |args, io| {
                            ran_tx.send(()).ok();
                            let emphasis = io.env()["emphasis"].as_str().unwrap_or_default().to_string();
                            let text = args[0].as_str().unwrap_or_default();
                            let _ = io.reply(json!(format!("{text}{emphasis}")));
                        }),
                    ),
                ],
                CommandDescriptor::new().onopen(|env, _io| {
                    if env.get("emphasis").is_some() {
                        Ok(())
                    } else {
                        Err("Cannot shout without emphasis".to_string())
                    }
                }),
            )
            .unwrap();
        server.announce().unwrap();

        // Accepted invocation: env carries emphasis.
        let (reply, _) = client
            .call_env("@echos loud", json!(["hi"]), json!({"emphasis": "!!"}))
            .unwrap();
        assert_eq!(reply, json!("hi!!"));
        ran_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // Rejected invocation: the hook error surfaces remotely and the
        // handler never runs.
        let err = client.call("@echos loud", json!(["hi"])).unwrap_err();
        assert!(matches!(err, ProtoError::Remote(msg) if msg.contains("emphasis")));
        assert!(ran_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn descriptor_encoding_switches_the_channel_codec() {
        let (server, client) = connected_pair("server", "client");

        server
            .register(
                "tail-json",
                CommandDescriptor::new()
                    .streaming()
                    .encoding(Encoding::Json)
                    .oncall(|_args, io| {
                        let _ = io.data(json!({"line": 1}));
                        let _ = io.fin();
                    }),
            )
            .unwrap();
        server.announce().unwrap();

        let io = client.call_stream("tail-json", Value::Null);
        assert_eq!(io.recv_data(), Some(Payload::Json(json!({"line": 1}))));
        assert_eq!(io.recv_data(), None);
    }

    #[test]
    fn log_stream_runs_parallel_to_data() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("work", |_args, io| {
                let _ = io.log(json!({"progress": 50}));
                let _ = io.log_error("partial failure");
                let _ = io.reply(json!("done"));
            })
            .unwrap();
        server.announce().unwrap();

        let (reply, io) = client.call("work", Value::Null).unwrap();
        assert_eq!(reply, json!("done"));
        assert_eq!(io.recv_log(), Some(Payload::Json(json!({"progress": 50}))));
        assert_eq!(
            io.recv_log(),
            Some(Payload::Json(json!({"error": "partial failure"})))
        );
    }

    #[test]
    fn close_is_idempotent_across_both_sides() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("hold", |_args, io| {
                let _ = io.reply(json!("held"));
            })
            .unwrap();
        server.announce().unwrap();

        let (_, io) = client.call("hold", Value::Null).unwrap();
        io.close(None);
        io.close(Some("ignored".to_string()));
        io.close(None);
        assert!(io.is_closed());
        assert!(io.remote_error().is_none());
    }

    #[test]
    fn sibling_channels_survive_one_channels_violation() {
        let (server, client) = connected_pair("server", "client");

        server
            .command("echo", |args, io| {
                let _ = io.reply(args);
            })
            .unwrap();
        server.announce().unwrap();

        let (reply_before, held) = client.call("echo", json!("first")).unwrap();
        assert_eq!(reply_before, json!("first"));

        // Violate on a fresh channel: a second Command frame.
        let (_, bad) = client.call("echo", json!("second")).unwrap();
        let err = bad.channel().command("echo", json!("again")).unwrap_err();
        assert!(matches!(err, ProtoError::Protocol(_)));
        assert!(bad.is_closed());

        // The connection and other channels still work.
        let (reply_after, _) = client.call("echo", json!("third")).unwrap();
        assert_eq!(reply_after, json!("third"));
        assert!(held.remote_error().is_none());
    }

    #[test]
    fn endpoint_close_fails_open_channels_with_connection_error() {
        let (server, client) = connected_pair("server", "client");

        server
            .register(
                "wait",
                CommandDescriptor::new().streaming().oncall(|_args, _io| {
                    // Keep the channel open; never reply.
                }),
            )
            .unwrap();
        server.announce().unwrap();

        let io = client.call_stream("wait", Value::Null);
        assert!(!io.is_closed());

        client.close();
        assert!(io.wait_closed_timeout(Duration::from_secs(1)));
        let err = io.wait_reply(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ProtoError::ConnectionClosed(_)));
    }

    #[test]
    fn registering_after_announce_reannounces() {
        let (server, client) = connected_pair("server", "client");
        server.announce().unwrap();
        client.ready().unwrap();
        assert!(client.ready().unwrap().commands.is_empty());

        server
            .command("late", |_args, io| {
                let _ = io.reply(json!("here"));
            })
            .unwrap();

        // The updated manifest reaches the peer without an explicit announce.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if client
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("late"))
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "manifest never updated");
            thread::sleep(Duration::from_millis(10));
        }

        let (reply, _) = client.call("late", Value::Null).unwrap();
        assert_eq!(reply, json!("here"));
    }

    #[test]
    fn extension_messages_roundtrip() {
        let (server, client) = connected_pair("server", "client");
        let (tx, rx) = mpsc::channel();
        server.on_extension(move |id, payload| {
            tx.send((id, payload.to_vec())).expect("extension channel");
        });

        client.send_extension(42, b"probe").unwrap();
        let (id, payload) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, b"probe");
    }

    #[test]
    fn announce_extras_are_delivered() {
        let (server, client) = connected_pair("server", "client");

        let mut extra = BTreeMap::new();
        extra.insert("version".to_string(), json!("1.2.3"));
        server.announce_with(extra).unwrap();

        let manifest = client.ready().unwrap();
        assert_eq!(manifest.name.as_deref(), Some("server"));
        assert_eq!(manifest.extra["version"], json!("1.2.3"));
    }
}
