//! Command mesh over many connections.
//!
//! A Router shares one registry across every endpoint it owns. When an
//! exposed peer announces its manifest, the router registers `"@peer cmd"`
//! proxies that splice a locally invoked channel to the real command on that
//! peer, then re-announces the combined manifest so forwarding is visible
//! transitively.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, info};

use crate::channel::ChannelIo;
use crate::endpoint::{AnnounceHook, Endpoint, EndpointConfig};
use crate::error::{ProtoError, Result};
use crate::manifest::Manifest;
use crate::pipe::pipe;
use crate::registry::{CommandDescriptor, CommandRegistry};

// Hard cap on how many routers a command may be forwarded through.
const MAX_FORWARD_DEPTH: usize = 4;

/// Per-connection options.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Connection name; autogenerated when absent.
    pub name: Option<String>,
    /// Learn the peer's commands and expose them as local proxies.
    pub expose: bool,
}

impl ConnectionOptions {
    pub fn exposed() -> Self {
        Self {
            name: None,
            expose: true,
        }
    }
}

struct RouterInner {
    name: String,
    registry: Arc<CommandRegistry>,
    connections: Mutex<Vec<Endpoint>>,
    remotes: Mutex<HashMap<String, Endpoint>>,
    conn_seq: AtomicU64,
}

/// Shares one command registry across many connections and forwards between
/// them.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                name: name.into(),
                registry: Arc::new(CommandRegistry::new()),
                connections: Mutex::new(Vec::new()),
                remotes: Mutex::new(HashMap::new()),
                conn_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.inner.registry
    }

    /// Wrap a transport pair in an endpoint sharing this router's registry
    /// and announce to it immediately.
    pub fn connection<R, W>(
        &self,
        reader: R,
        writer: W,
        options: ConnectionOptions,
    ) -> Result<Endpoint>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let seq = self.inner.conn_seq.fetch_add(1, Ordering::Relaxed);
        let name = options
            .name
            .unwrap_or_else(|| format!("{}-conn-{seq}", self.inner.name));
        let mut config = EndpointConfig::named(name);
        config.announce_name = Some(self.inner.name.clone());

        let hook: Option<AnnounceHook> = if options.expose {
            let weak = Arc::downgrade(&self.inner);
            Some(Arc::new(move |endpoint: &Endpoint, manifest: Manifest| {
                if let Some(inner) = weak.upgrade() {
                    on_remote_announce(&inner, endpoint, manifest);
                }
            }))
        } else {
            None
        };

        let endpoint = Endpoint::build(
            reader,
            writer,
            config,
            Arc::clone(&self.inner.registry),
            hook,
        )?;
        endpoint.announce()?;
        self.inner
            .connections
            .lock()
            .expect("router connections lock poisoned")
            .push(endpoint.clone());
        Ok(endpoint)
    }

    /// Register a bare handler and re-announce everywhere.
    pub fn command(
        &self,
        name: &str,
        f: impl Fn(Value, ChannelIo) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.registry.add_handler(name, f)?;
        self.announce();
        Ok(())
    }

    /// Register a full descriptor and re-announce everywhere.
    pub fn register(&self, name: &str, descriptor: CommandDescriptor) -> Result<()> {
        self.inner.registry.add(name, descriptor)?;
        self.announce();
        Ok(())
    }

    /// Register a batch of commands and re-announce everywhere.
    pub fn commands(
        &self,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
    ) -> Result<()> {
        self.inner.registry.batch(entries)?;
        self.announce();
        Ok(())
    }

    /// Register a scoped service and re-announce everywhere.
    pub fn service(
        &self,
        prefix: &str,
        entries: impl IntoIterator<Item = (String, CommandDescriptor)>,
        defaults: CommandDescriptor,
    ) -> Result<()> {
        self.inner.registry.service(prefix, entries, defaults)?;
        self.announce();
        Ok(())
    }

    /// Announce the current manifest to every connection.
    pub fn announce(&self) {
        announce_all(&self.inner);
    }

    /// Invoke a command directly on a named peer.
    pub fn call(&self, peer: &str, cmd: &str, args: Value) -> Result<(Value, ChannelIo)> {
        self.call_env(peer, cmd, args, Value::Null)
    }

    /// Invoke a command on a named peer with a caller environment.
    pub fn call_env(
        &self,
        peer: &str,
        cmd: &str,
        args: Value,
        env: Value,
    ) -> Result<(Value, ChannelIo)> {
        let endpoint = self
            .inner
            .remotes
            .lock()
            .expect("router remotes lock poisoned")
            .get(peer)
            .cloned()
            .ok_or_else(|| ProtoError::UnknownPeer(peer.to_string()))?;
        endpoint.call_env(cmd, args, env)
    }

    /// Names of peers that have announced to this router.
    pub fn remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .remotes
            .lock()
            .expect("router remotes lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Close every connection.
    pub fn close(&self) {
        let connections = self
            .inner
            .connections
            .lock()
            .expect("router connections lock poisoned")
            .clone();
        for endpoint in connections {
            endpoint.close();
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

fn announce_all(inner: &RouterInner) {
    let connections = inner
        .connections
        .lock()
        .expect("router connections lock poisoned")
        .clone();
    for endpoint in connections {
        if let Err(err) = endpoint.announce() {
            debug!(router = %inner.name, conn = endpoint.name(), %err, "announce failed");
        }
    }
}

fn on_remote_announce(inner: &Arc<RouterInner>, endpoint: &Endpoint, manifest: Manifest) {
    let Some(peer) = manifest.name.clone() else {
        debug!(router = %inner.name, "ignoring announce without a peer name");
        return;
    };
    inner
        .remotes
        .lock()
        .expect("router remotes lock poisoned")
        .insert(peer.clone(), endpoint.clone());
    info!(
        router = %inner.name,
        peer = %peer,
        commands = manifest.commands.len(),
        "remote manifest received"
    );

    let mut changed = false;
    for (cmd, cmd_info) in &manifest.commands {
        // Never proxy a command that was forwarded through this router
        // already; that is how two routers exposing each other converge
        // instead of re-announcing forever.
        if scope_names(cmd).any(|scope| scope == inner.name) {
            continue;
        }
        if scope_names(cmd).count() >= MAX_FORWARD_DEPTH {
            debug!(router = %inner.name, cmd, "forward depth cap reached");
            continue;
        }

        let scoped = format!("@{peer} {cmd}");
        let descriptor = proxy_descriptor(cmd_info, endpoint.clone(), cmd.clone());
        if let Some(existing) = inner.registry.get(&scoped) {
            if existing.info() == descriptor.info() {
                continue;
            }
        }
        if inner.registry.add(&scoped, descriptor).is_ok() {
            changed = true;
        }
    }

    if changed {
        announce_all(inner);
    }
}

/// A local command that forwards to `target` and splices the channels.
fn proxy_descriptor(
    info: &crate::manifest::CommandInfo,
    target: Endpoint,
    cmd: String,
) -> CommandDescriptor {
    CommandDescriptor::from_info(info).oncall(move |args, inbound: ChannelIo| {
        match target.open_proxy(&cmd, args, inbound.env()) {
            Ok(outbound) => pipe(&inbound, &outbound),
            Err(err) => inbound.close(Some(err.to_string())),
        }
    })
}

/// Scope names of a forwarded command: `"@r2 @b echo"` yields `r2`, `b`.
fn scope_names(cmd: &str) -> impl Iterator<Item = &str> {
    cmd.split(' ')
        .take_while(|token| token.starts_with('@'))
        .map(|token| &token[1..])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;

    use cmdmux_transport::duplex_pair;
    use serde_json::json;

    use super::*;
    use crate::encoding::Payload;
    use crate::error::ProtoError;

    fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting: {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Client endpoints A and B joined through one router.
    fn forwarded_mesh() -> (Router, Endpoint, Endpoint) {
        let router = Router::new("hub");
        let (a_router_side, a_client_side) = duplex_pair();
        let (b_router_side, b_client_side) = duplex_pair();

        router
            .connection(
                a_router_side.clone(),
                a_router_side,
                ConnectionOptions::exposed(),
            )
            .unwrap();
        router
            .connection(
                b_router_side.clone(),
                b_router_side,
                ConnectionOptions::exposed(),
            )
            .unwrap();

        let client_a = Endpoint::new(
            a_client_side.clone(),
            a_client_side,
            EndpointConfig::named("alpha"),
        )
        .unwrap();
        let client_b = Endpoint::new(
            b_client_side.clone(),
            b_client_side,
            EndpointConfig::named("beta"),
        )
        .unwrap();

        (router, client_a, client_b)
    }

    #[test]
    fn commands_forward_across_the_router() {
        let (_router, client_a, client_b) = forwarded_mesh();

        client_b
            .command("echo", |args, io| {
                let text = args.as_str().unwrap_or_default().to_uppercase();
                let _ = io.reply(json!(text));
            })
            .unwrap();
        client_b.announce().unwrap();

        wait_for("proxy visible to alpha", || {
            client_a
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("@beta echo"))
        });

        let (reply, _) = client_a.call("@beta echo", json!("hello world")).unwrap();
        assert_eq!(reply, json!("HELLO WORLD"));
    }

    #[test]
    fn remote_errors_stay_remote_through_the_pipe() {
        let (_router, client_a, client_b) = forwarded_mesh();

        client_b
            .command("fail", |_args, io| {
                io.close(Some("beta side failure".to_string()));
            })
            .unwrap();
        client_b.announce().unwrap();

        wait_for("proxy visible to alpha", || {
            client_a
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("@beta fail"))
        });

        let err = client_a.call("@beta fail", Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::Remote(msg) if msg.contains("beta side failure")));
    }

    #[test]
    fn data_and_log_streams_bridge_both_directions() {
        let (_router, client_a, client_b) = forwarded_mesh();

        client_b
            .register(
                "shout",
                CommandDescriptor::new().streaming().oncall(|_args, io| {
                    let _ = io.log(json!({"state": "started"}));
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
        client_b.announce().unwrap();

        wait_for("proxy visible to alpha", || {
            client_a
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("@beta shout"))
        });

        let io = client_a.call_stream("@beta shout", Value::Null);
        io.data("quiet words").unwrap();
        io.fin().unwrap();

        assert_eq!(io.recv_data().unwrap().to_text(), "QUIET WORDS");
        assert_eq!(io.recv_data(), None);
        assert_eq!(
            io.recv_log_timeout(Duration::from_secs(2)).unwrap(),
            Some(Payload::Json(json!({"state": "started"})))
        );
    }

    #[test]
    fn env_travels_through_the_proxy() {
        let (_router, client_a, client_b) = forwarded_mesh();

        client_b
            .command("whoami", |_args, io| {
                let user = io.env()["user"].clone();
                let _ = io.reply(user);
            })
            .unwrap();
        client_b.announce().unwrap();

        wait_for("proxy visible to alpha", || {
            client_a
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("@beta whoami"))
        });

        let (reply, _) = client_a
            .call_env("@beta whoami", Value::Null, json!({"user": "mara"}))
            .unwrap();
        assert_eq!(reply, json!("mara"));
    }

    #[test]
    fn router_call_reaches_named_peers() {
        let (router, _client_a, client_b) = forwarded_mesh();

        client_b
            .command("ping", |_args, io| {
                let _ = io.reply(json!("pong"));
            })
            .unwrap();
        client_b.announce().unwrap();

        wait_for("peer registered", || router.remotes().contains(&"beta".to_string()));

        let (reply, _) = router.call("beta", "ping", Value::Null).unwrap();
        assert_eq!(reply, json!("pong"));

        let err = router.call("gamma", "ping", Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownPeer(name) if name == "gamma"));
    }

    #[test]
    fn forwarding_is_transitively_announced() {
        let (_router, client_a, client_b) = forwarded_mesh();

        client_b
            .command("echo", |args, io| {
                let _ = io.reply(args);
            })
            .unwrap();
        client_b.announce().unwrap();

        // Alpha never registered anything, but still learns beta's command
        // through the router's combined manifest.
        wait_for("transitive visibility", || {
            client_a
                .remote_manifest()
                .is_some_and(|m| m.commands.contains_key("@beta echo"))
        });
        let manifest = client_a.remote_manifest().unwrap();
        assert_eq!(manifest.name.as_deref(), Some("hub"));
    }

    #[test]
    fn two_routers_exposing_each_other_converge() {
        let left = Router::new("left");
        let right = Router::new("right");

        left.command("west", |_args, io| {
            let _ = io.reply(json!("from the left"));
        })
        .unwrap();
        right
            .command("east", |_args, io| {
                let _ = io.reply(json!("from the right"));
            })
            .unwrap();

        let (l_side, r_side) = duplex_pair();
        left.connection(l_side.clone(), l_side, ConnectionOptions::exposed())
            .unwrap();
        right
            .connection(r_side.clone(), r_side, ConnectionOptions::exposed())
            .unwrap();

        // Each side learns exactly one proxy for the other's command and the
        // announce exchange settles instead of looping.
        wait_for("left learns east", || left.registry().has("@right east"));
        wait_for("right learns west", || right.registry().has("@left west"));
        thread::sleep(Duration::from_millis(100));

        let left_names: Vec<String> = left.registry().manifest().keys().cloned().collect();
        assert_eq!(left_names, vec!["@right east", "west"]);
        let right_names: Vec<String> = right.registry().manifest().keys().cloned().collect();
        assert_eq!(right_names, vec!["@left west", "east"]);
    }

    #[test]
    fn scope_parsing_sees_forwarding_chains() {
        let chain = "@r2 @b echo";
        let scopes: Vec<&str> = scope_names(chain).collect();
        assert_eq!(scopes, vec!["r2", "b"]);

        assert_eq!(scope_names("echo").count(), 0);
        assert_eq!(scope_names("@a nested cmd").count(), 1);
    }

    #[test]
    fn announce_extras_survive_router_connections() {
        let router = Router::new("hub");
        let (router_side, client_side) = duplex_pair();
        router
            .connection(router_side.clone(), router_side, ConnectionOptions::default())
            .unwrap();

        let client = Endpoint::new(
            client_side.clone(),
            client_side,
            EndpointConfig::named("client"),
        )
        .unwrap();

        let mut extra = BTreeMap::new();
        extra.insert("region".to_string(), json!("eu-1"));
        client.announce_with(extra).unwrap();

        let manifest = client.ready().unwrap();
        assert_eq!(manifest.name.as_deref(), Some("hub"));
    }
}
