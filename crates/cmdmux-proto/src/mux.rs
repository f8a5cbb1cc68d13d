//! Per-connection channel tables and frame dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cmdmux_wire::{varint, MessageType, WireFrame, CONTROL_CHANNEL};
use serde_json::Value;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::{Cause, Channel, ChannelIo, FrameSink, OpenMsg};
use crate::encoding::Encoding;
use crate::error::Result;
use crate::manifest::{Manifest, Mode};

// Upper bound on the peer-assigned slot number we will table; bounds memory
// against a hostile or broken peer.
const MAX_REMOTE_SLOT: u64 = 1 << 20;

/// Connection-level hooks the multiplexer dispatches into.
pub(crate) struct MuxHooks {
    /// A Command arrived on a channel; dispatch it.
    pub oncall: Arc<dyn Fn(String, Value, ChannelIo) + Send + Sync>,
    /// An Announce arrived on the control channel.
    pub onannounce: Arc<dyn Fn(Manifest) + Send + Sync>,
    /// An Extension message arrived on the control channel.
    pub onextension: Arc<dyn Fn(u64, Bytes) + Send + Sync>,
}

#[derive(Default)]
struct Tables {
    /// Slot 0 is permanently reserved for the control channel.
    local: Vec<Option<Arc<Channel>>>,
    /// Indexed by the peer's slot number as it appears on the wire.
    remote: Vec<Option<Arc<Channel>>>,
    /// Invocation id to channel, for Open correlation.
    by_id: HashMap<String, Arc<Channel>>,
}

/// Owns every live channel of one connection and routes frames to them.
///
/// All frame handling runs on the connection's single reader thread; the
/// tables are locked briefly per operation so application threads can open
/// and destroy channels concurrently.
pub(crate) struct Multiplexer {
    conn: String,
    sink: FrameSink,
    hooks: MuxHooks,
    tables: Mutex<Tables>,
}

impl Multiplexer {
    pub(crate) fn new(conn: String, sink: FrameSink, hooks: MuxHooks) -> Arc<Self> {
        Arc::new(Self {
            conn,
            sink,
            hooks,
            tables: Mutex::new(Tables {
                local: vec![None],
                remote: Vec::new(),
                by_id: HashMap::new(),
            }),
        })
    }

    /// Allocate a slot and a fresh invocation id for an outgoing channel.
    pub(crate) fn create_local_channel(
        self: &Arc<Self>,
        mode: Mode,
        encoding: Encoding,
        log_encoding: Encoding,
    ) -> Arc<Channel> {
        let id = Uuid::new_v4().to_string();
        let channel = Channel::new(
            id.clone(),
            self.conn.clone(),
            self.sink.clone(),
            Arc::downgrade(self),
            mode,
            encoding,
            log_encoding,
        );
        let mut tables = self.tables.lock().expect("mux tables lock poisoned");
        let slot = attach_local(&mut tables, &channel);
        tables.by_id.insert(id, Arc::clone(&channel));
        trace!(conn = %self.conn, channel = %channel.id(), slot, "local channel created");
        channel
    }

    /// Route one decoded frame.
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: WireFrame) {
        let Some(kind) = frame.message_type() else {
            debug!(conn = %self.conn, tag = frame.tag, "dropping reserved message type");
            return;
        };

        if frame.channel == CONTROL_CHANNEL {
            self.handle_control(kind, frame.payload);
            return;
        }

        if kind == MessageType::Open {
            self.handle_open(frame.channel, &frame.payload);
            return;
        }

        let channel = {
            let tables = self.tables.lock().expect("mux tables lock poisoned");
            tables
                .remote
                .get(frame.channel as usize)
                .and_then(|slot| slot.clone())
        };
        let Some(channel) = channel else {
            // The peer may still be draining frames for a channel this side
            // already destroyed.
            trace!(conn = %self.conn, slot = frame.channel, "frame for unknown or closed slot");
            return;
        };

        match kind {
            MessageType::Command => {
                if let Some((cmd, args)) = channel.on_command(&frame.payload) {
                    (self.hooks.oncall)(cmd, args, ChannelIo::new(channel));
                }
            }
            MessageType::Reply => channel.on_reply(&frame.payload),
            MessageType::Data => channel.on_data(frame.payload),
            MessageType::Log => channel.on_log(frame.payload),
            MessageType::Fin => channel.on_fin(),
            MessageType::Close => channel.on_close(&frame.payload),
            MessageType::Open | MessageType::Announce | MessageType::Extension => {
                debug!(conn = %self.conn, ?kind, "control-type message on a data channel");
            }
        }
    }

    fn handle_control(&self, kind: MessageType, payload: Bytes) {
        match kind {
            MessageType::Announce => match serde_json::from_slice::<Manifest>(&payload) {
                Ok(manifest) => (self.hooks.onannounce)(manifest),
                Err(err) => warn!(conn = %self.conn, %err, "malformed announce payload"),
            },
            MessageType::Extension => match varint::decode(&payload) {
                Ok(Some((id, len))) => {
                    (self.hooks.onextension)(id, payload.slice(len..));
                }
                _ => warn!(conn = %self.conn, "malformed extension payload"),
            },
            other => {
                debug!(conn = %self.conn, ?other, "unexpected message type on control channel");
            }
        }
    }

    fn handle_open(self: &Arc<Self>, slot: u64, raw: &Bytes) {
        let msg: OpenMsg = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(conn = %self.conn, %err, "malformed open payload");
                return;
            }
        };
        if slot > MAX_REMOTE_SLOT {
            warn!(conn = %self.conn, slot, "open on out-of-range slot");
            return;
        }

        let channel = {
            let mut tables = self.tables.lock().expect("mux tables lock poisoned");
            let channel = match tables.by_id.get(&msg.id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    // Responder side: the peer initiated this invocation.
                    let channel = Channel::new(
                        msg.id.clone(),
                        self.conn.clone(),
                        self.sink.clone(),
                        Arc::downgrade(self),
                        Mode::default(),
                        Encoding::Binary,
                        Encoding::Json,
                    );
                    tables.by_id.insert(msg.id.clone(), Arc::clone(&channel));
                    channel
                }
            };

            let index = slot as usize;
            if tables.remote.len() <= index {
                tables.remote.resize(index + 1, None);
            }
            tables.remote[index] = Some(Arc::clone(&channel));
            channel.set_remote_id(slot);
            if channel.local_id().is_none() {
                attach_local(&mut tables, &channel);
            }
            channel
        };

        if let Err(err) = channel.on_remote_open(msg.env) {
            debug!(conn = %self.conn, channel = %channel.id(), %err, "open handling failed");
        }
    }

    /// Free a destroyed channel's slots and id mapping.
    pub(crate) fn detach(&self, id: &str, local_id: Option<u64>, remote_id: Option<u64>) {
        let mut tables = self.tables.lock().expect("mux tables lock poisoned");
        if let Some(index) = local_id {
            if let Some(slot) = tables.local.get_mut(index as usize) {
                *slot = None;
            }
        }
        if let Some(index) = remote_id {
            if let Some(slot) = tables.remote.get_mut(index as usize) {
                *slot = None;
            }
        }
        tables.by_id.remove(id);
    }

    /// Destroy every channel; the connection is gone.
    pub(crate) fn destroy_all(&self, reason: &str) {
        let channels: Vec<Arc<Channel>> = {
            let tables = self.tables.lock().expect("mux tables lock poisoned");
            tables.by_id.values().cloned().collect()
        };
        debug!(conn = %self.conn, count = channels.len(), reason, "destroying all channels");
        for channel in channels {
            channel.destroy(Cause::Transport(reason.to_string()));
        }
    }

    /// Send a control-channel message.
    pub(crate) fn send_control(&self, kind: MessageType, payload: &[u8]) -> Result<()> {
        (self.sink)(CONTROL_CHANNEL, kind, payload)
    }

    #[cfg(test)]
    fn slots_in_use(&self) -> (usize, usize) {
        let tables = self.tables.lock().expect("mux tables lock poisoned");
        (
            tables.local.iter().filter(|slot| slot.is_some()).count(),
            tables.by_id.len(),
        )
    }
}

/// First free local slot at index >= 1; grows the table when full.
fn attach_local(tables: &mut Tables, channel: &Arc<Channel>) -> u64 {
    let index = tables
        .local
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, slot)| slot.is_none())
        .map(|(index, _)| index)
        .unwrap_or_else(|| {
            tables.local.push(None);
            tables.local.len() - 1
        });
    tables.local[index] = Some(Arc::clone(channel));
    channel.set_local_id(index as u64);
    index as u64
}
