//! Per-invocation channel state machine.
//!
//! A channel is one command invocation's duplex conversation, multiplexed
//! with others over a shared connection. The state machine enforces the
//! ordering rules (one Command each way, Reply only after Command, payload
//! only after Open); a violation destroys that one channel and leaves the
//! connection and its sibling channels alone.

use std::sync::mpsc::{channel as mpsc_channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use cmdmux_wire::MessageType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::encoding::{Encoding, Payload};
use crate::error::{ProtoError, Result};
use crate::manifest::Mode;
use crate::mux::Multiplexer;

/// Sends one frame on the connection this channel lives on.
pub(crate) type FrameSink = Arc<dyn Fn(u64, MessageType, &[u8]) -> Result<()> + Send + Sync>;

/// Open payload: the invocation id both peers share, plus caller environment.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OpenMsg {
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub env: Value,
}

/// Command payload.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommandMsg {
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

/// Close payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CloseMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal outcome of one invocation, as seen by the calling side.
///
/// Exactly one outcome wins per channel; later resolutions are no-ops.
#[derive(Debug, Clone)]
pub(crate) enum CallOutcome {
    /// The peer replied.
    Reply(Value),
    /// The peer closed with an error payload.
    RemoteError(String),
    /// The channel closed cleanly without a reply.
    Closed,
    /// A local failure (protocol violation, dead connection, precondition).
    Failed(Arc<ProtoError>),
}

/// One-shot slot with "first resolution wins" semantics.
pub(crate) struct OutcomeCell {
    slot: Mutex<Option<CallOutcome>>,
    cond: Condvar,
}

impl OutcomeCell {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: CallOutcome) {
        let mut slot = self.slot.lock().expect("outcome lock poisoned");
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Result<CallOutcome> {
        let mut slot = self.slot.lock().expect("outcome lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Ok(outcome.clone());
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(ProtoError::Timeout(timeout));
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, remaining)
                .expect("outcome lock poisoned");
            slot = guard;
        }
    }

    fn wait_blocking(&self) -> CallOutcome {
        let mut slot = self.slot.lock().expect("outcome lock poisoned");
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.cond.wait(slot).expect("outcome lock poisoned");
        }
    }
}

/// Latch that opens once, with blocking waiters.
struct Gate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut flag = self.flag.lock().expect("gate lock poisoned");
        *flag = true;
        self.cond.notify_all();
    }

    fn is_open(&self) -> bool {
        *self.flag.lock().expect("gate lock poisoned")
    }

    fn wait(&self) {
        let mut flag = self.flag.lock().expect("gate lock poisoned");
        while !*flag {
            flag = self.cond.wait(flag).expect("gate lock poisoned");
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock().expect("gate lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*flag {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(flag, remaining)
                .expect("gate lock poisoned");
            flag = guard;
        }
        true
    }
}

/// Why a channel is being destroyed.
pub(crate) enum Cause {
    /// The application closed the invocation, optionally with an error the
    /// peer should see.
    AppClose(Option<String>),
    /// An ordering violation was detected locally.
    Violation(String),
    /// The peer signaled completion (its Close error, if any).
    RemoteClose(Option<String>),
    /// The whole connection is gone; no frames can be sent.
    Transport(String),
}

struct ChannelState {
    local_id: Option<u64>,
    remote_id: Option<u64>,
    mode: Mode,
    env: Value,
    encoding: Encoding,
    log_encoding: Encoding,
    opened: bool,
    command_sent: bool,
    command_received: bool,
    local_closed: bool,
    remote_closed: bool,
    close_sent: bool,
    destroyed: bool,
    terminal_error: Option<String>,
    remote_error: Option<String>,
    data_tx: Option<Sender<Payload>>,
    log_tx: Option<Sender<Payload>>,
}

pub(crate) struct Channel {
    id: String,
    conn: String,
    sink: FrameSink,
    mux: Weak<Multiplexer>,
    state: Mutex<ChannelState>,
    data_rx: Mutex<Receiver<Payload>>,
    log_rx: Mutex<Receiver<Payload>>,
    outcome: OutcomeCell,
    closed: Gate,
}

impl Channel {
    pub(crate) fn new(
        id: String,
        conn: String,
        sink: FrameSink,
        mux: Weak<Multiplexer>,
        mode: Mode,
        encoding: Encoding,
        log_encoding: Encoding,
    ) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc_channel();
        let (log_tx, log_rx) = mpsc_channel();
        Arc::new(Self {
            id,
            conn,
            sink,
            mux,
            state: Mutex::new(ChannelState {
                local_id: None,
                remote_id: None,
                mode,
                env: Value::Null,
                encoding,
                log_encoding,
                opened: false,
                command_sent: false,
                command_received: false,
                local_closed: false,
                remote_closed: false,
                close_sent: false,
                destroyed: false,
                terminal_error: None,
                remote_error: None,
                data_tx: Some(data_tx),
                log_tx: Some(log_tx),
            }),
            data_rx: Mutex::new(data_rx),
            log_rx: Mutex::new(log_rx),
            outcome: OutcomeCell::new(),
            closed: Gate::new(),
        })
    }

    /// A channel that was never attached: it exists only to deliver `err` to
    /// stream-shaped callers.
    pub(crate) fn failed(err: ProtoError) -> Arc<Self> {
        let ch = Self::new(
            String::new(),
            String::new(),
            Arc::new(|_, _, _| Ok(())),
            Weak::new(),
            Mode::Async,
            Encoding::Binary,
            Encoding::Json,
        );
        {
            let mut st = ch.state.lock().expect("channel lock poisoned");
            st.destroyed = true;
            st.terminal_error = Some(err.to_string());
            st.data_tx = None;
            st.log_tx = None;
        }
        ch.outcome.resolve(CallOutcome::Failed(Arc::new(err)));
        ch.closed.open();
        ch
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn local_id(&self) -> Option<u64> {
        self.state.lock().expect("channel lock poisoned").local_id
    }

    pub(crate) fn set_local_id(&self, slot: u64) {
        self.state.lock().expect("channel lock poisoned").local_id = Some(slot);
    }

    pub(crate) fn set_remote_id(&self, slot: u64) {
        self.state.lock().expect("channel lock poisoned").remote_id = Some(slot);
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.state.lock().expect("channel lock poisoned").mode = mode;
    }

    pub(crate) fn set_encodings(&self, encoding: Option<Encoding>, log_encoding: Option<Encoding>) {
        let mut st = self.state.lock().expect("channel lock poisoned");
        if let Some(encoding) = encoding {
            st.encoding = encoding;
        }
        if let Some(log_encoding) = log_encoding {
            st.log_encoding = log_encoding;
        }
    }

    fn send_on(&self, st: &ChannelState, kind: MessageType, payload: &[u8]) -> Result<()> {
        let local_id = st
            .local_id
            .ok_or_else(|| ProtoError::Protocol("channel is not attached".to_string()))?;
        (self.sink)(local_id, kind, payload)
    }

    fn violation(&self, message: &str) -> ProtoError {
        warn!(conn = %self.conn, channel = %self.id, message, "protocol violation");
        self.destroy(Cause::Violation(message.to_string()));
        ProtoError::Protocol(message.to_string())
    }

    /// Send Open once. Repeat calls are no-ops.
    pub(crate) fn open(&self, env: Value) -> Result<()> {
        let mut st = self.state.lock().expect("channel lock poisoned");
        if st.opened || st.destroyed {
            return Ok(());
        }
        st.opened = true;
        if !env.is_null() {
            st.env = env.clone();
        }
        let msg = OpenMsg {
            id: self.id.clone(),
            env,
        };
        let payload = serde_json::to_vec(&msg)?;
        self.send_on(&st, MessageType::Open, &payload)
    }

    /// Send the channel's one Command. A second send destroys the channel.
    pub(crate) fn command(&self, cmd: &str, args: Value) -> Result<()> {
        {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return Err(ProtoError::ChannelClosed);
            }
            if st.command_sent {
                drop(st);
                return Err(self.violation("duplicate command on channel"));
            }
            st.command_sent = true;
            let msg = CommandMsg {
                cmd: cmd.to_string(),
                args,
            };
            let payload = serde_json::to_vec(&msg)?;
            self.send_on(&st, MessageType::Command, &payload)?;
        }
        trace!(conn = %self.conn, channel = %self.id, cmd, "command sent");
        Ok(())
    }

    /// Send the single Reply. Valid only after a Command arrived, and only on
    /// async-mode channels.
    pub(crate) fn reply(&self, value: Value) -> Result<()> {
        let st = self.state.lock().expect("channel lock poisoned");
        if st.destroyed {
            return Err(ProtoError::ChannelClosed);
        }
        if !st.command_received {
            drop(st);
            return Err(self.violation("reply before receiving a command"));
        }
        if st.mode == Mode::Streaming {
            drop(st);
            return Err(self.violation("reply on a streaming-mode channel"));
        }
        let payload = serde_json::to_vec(&value)?;
        self.send_on(&st, MessageType::Reply, &payload)
    }

    /// Send one Data message through the negotiated encoding.
    pub(crate) fn data(&self, payload: &Payload) -> Result<()> {
        let st = self.state.lock().expect("channel lock poisoned");
        if st.destroyed || st.local_closed {
            return Err(ProtoError::ChannelClosed);
        }
        if !st.opened {
            drop(st);
            return Err(self.violation("data before open"));
        }
        let wire = st.encoding.encode(payload)?;
        self.send_on(&st, MessageType::Data, &wire)
    }

    /// Send one Log message through the log encoding.
    pub(crate) fn log(&self, payload: &Payload) -> Result<()> {
        let st = self.state.lock().expect("channel lock poisoned");
        if st.destroyed {
            return Err(ProtoError::ChannelClosed);
        }
        let wire = st.log_encoding.encode(payload)?;
        self.send_on(&st, MessageType::Log, &wire)
    }

    /// Signal that this side will send no more data.
    pub(crate) fn fin(&self) -> Result<()> {
        let destroy_now = {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed || st.local_closed {
                return Ok(());
            }
            st.local_closed = true;
            self.send_on(&st, MessageType::Fin, b"{}")?;
            st.remote_closed
        };
        if destroy_now {
            self.destroy(Cause::AppClose(None));
        }
        Ok(())
    }

    /// Finish the invocation, optionally reporting an error to the peer.
    pub(crate) fn close(&self, error: Option<String>) {
        self.destroy(Cause::AppClose(error));
    }

    /// Tear the channel down. Runs at most once; ensures the peer gets a
    /// Close notification if one has not been sent yet.
    pub(crate) fn destroy(&self, cause: Cause) {
        let (local_id, remote_id, data_tx, log_tx);
        {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.local_closed = true;

            let wire_error = match &cause {
                Cause::AppClose(err) => err.clone(),
                Cause::Violation(msg) => Some(msg.clone()),
                Cause::RemoteClose(_) | Cause::Transport(_) => None,
            };
            st.terminal_error = match &cause {
                Cause::AppClose(err) => err.clone(),
                Cause::Violation(msg) | Cause::Transport(msg) => Some(msg.clone()),
                Cause::RemoteClose(err) => err.clone(),
            };
            if let Cause::RemoteClose(Some(err)) = &cause {
                st.remote_error = Some(err.clone());
            }

            if !st.close_sent && !matches!(cause, Cause::Transport(_)) {
                st.close_sent = true;
                let msg = CloseMsg { error: wire_error };
                if let Ok(payload) = serde_json::to_vec(&msg) {
                    let _ = self.send_on(&st, MessageType::Close, &payload);
                }
            }

            local_id = st.local_id;
            remote_id = st.remote_id;
            data_tx = st.data_tx.take();
            log_tx = st.log_tx.take();
        }
        drop(data_tx);
        drop(log_tx);

        self.outcome.resolve(match cause {
            Cause::RemoteClose(Some(err)) => CallOutcome::RemoteError(err),
            Cause::RemoteClose(None) | Cause::AppClose(_) => CallOutcome::Closed,
            Cause::Violation(msg) => {
                CallOutcome::Failed(Arc::new(ProtoError::Protocol(msg)))
            }
            Cause::Transport(msg) => {
                CallOutcome::Failed(Arc::new(ProtoError::ConnectionClosed(msg)))
            }
        });
        self.closed.open();

        if let Some(mux) = self.mux.upgrade() {
            mux.detach(&self.id, local_id, remote_id);
        }
        debug!(conn = %self.conn, channel = %self.id, "channel destroyed");
    }

    // Receive path, called from the connection's reader thread.

    /// The peer opened (or echoed the open of) this channel.
    pub(crate) fn on_remote_open(&self, env: Value) -> Result<()> {
        let mut st = self.state.lock().expect("channel lock poisoned");
        if st.destroyed {
            return Ok(());
        }
        if !env.is_null() {
            st.env = env;
        }
        if st.opened {
            return Ok(());
        }
        // Responder side: echo the open so the peer can map our slot.
        st.opened = true;
        let msg = OpenMsg {
            id: self.id.clone(),
            env: Value::Null,
        };
        let payload = serde_json::to_vec(&msg)?;
        self.send_on(&st, MessageType::Open, &payload)
    }

    /// A Command frame arrived; returns the invocation for dispatch, or
    /// `None` if the frame was a violation or the channel is gone.
    pub(crate) fn on_command(&self, raw: &Bytes) -> Option<(String, Value)> {
        {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return None;
            }
            if st.command_received {
                drop(st);
                let _ = self.violation("second command on channel");
                return None;
            }
            st.command_received = true;
        }
        match serde_json::from_slice::<CommandMsg>(raw) {
            Ok(msg) => Some((msg.cmd, msg.args)),
            Err(err) => {
                let _ = self.violation(&format!("malformed command payload: {err}"));
                None
            }
        }
    }

    pub(crate) fn on_reply(&self, raw: &Bytes) {
        {
            let st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            if !st.command_sent {
                drop(st);
                let _ = self.violation("reply before a command was sent");
                return;
            }
            if st.mode == Mode::Streaming {
                drop(st);
                let _ = self.violation("reply on a streaming-mode channel");
                return;
            }
        }
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => self.outcome.resolve(CallOutcome::Reply(value)),
            Err(err) => {
                let _ = self.violation(&format!("malformed reply payload: {err}"));
            }
        }
    }

    pub(crate) fn on_data(&self, raw: Bytes) {
        let (decoded, tx) = {
            let st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            if !st.opened {
                drop(st);
                let _ = self.violation("data before open");
                return;
            }
            (st.encoding.decode(raw), st.data_tx.clone())
        };
        match decoded {
            Ok(payload) => {
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
            }
            Err(err) => {
                let _ = self.violation(&format!("undecodable data payload: {err}"));
            }
        }
    }

    pub(crate) fn on_log(&self, raw: Bytes) {
        let (decoded, tx) = {
            let st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            (st.log_encoding.decode(raw), st.log_tx.clone())
        };
        match decoded {
            Ok(payload) => {
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
            }
            Err(err) => {
                debug!(conn = %self.conn, channel = %self.id, %err, "dropping undecodable log");
            }
        }
    }

    pub(crate) fn on_fin(&self) {
        let destroy_now = {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            st.remote_closed = true;
            // Inbound data is complete; unblock readers.
            st.data_tx = None;
            st.local_closed
        };
        if destroy_now {
            self.destroy(Cause::RemoteClose(None));
        }
    }

    pub(crate) fn on_close(&self, raw: &Bytes) {
        let msg: CloseMsg = serde_json::from_slice(raw).unwrap_or_default();
        {
            let mut st = self.state.lock().expect("channel lock poisoned");
            if st.destroyed {
                return;
            }
            st.remote_closed = true;
        }
        self.destroy(Cause::RemoteClose(msg.error));
    }

    // Application-facing accessors.

    pub(crate) fn mode(&self) -> Mode {
        self.state.lock().expect("channel lock poisoned").mode
    }

    pub(crate) fn env(&self) -> Value {
        self.state.lock().expect("channel lock poisoned").env.clone()
    }

    pub(crate) fn remote_error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("channel lock poisoned")
            .remote_error
            .clone()
    }

    pub(crate) fn terminal_error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("channel lock poisoned")
            .terminal_error
            .clone()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().expect("channel lock poisoned").destroyed
    }
}

/// Application handle onto one channel.
///
/// Cloneable; all clones view the same invocation. The receive methods
/// (`recv_data`, `recv_log`) are single-consumer: concurrent callers take
/// turns.
#[derive(Clone)]
pub struct ChannelIo {
    ch: Arc<Channel>,
}

impl ChannelIo {
    pub(crate) fn new(ch: Arc<Channel>) -> Self {
        Self { ch }
    }

    /// A dead handle that delivers `err` as its terminal outcome.
    pub(crate) fn failed(err: ProtoError) -> Self {
        Self {
            ch: Channel::failed(err),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.ch
    }

    /// The invocation id shared by both peers.
    pub fn id(&self) -> String {
        self.ch.id().to_string()
    }

    /// The channel's invocation mode.
    pub fn mode(&self) -> Mode {
        self.ch.mode()
    }

    /// Environment supplied by the caller at open time.
    pub fn env(&self) -> Value {
        self.ch.env()
    }

    /// Send the single reply to a received command.
    pub fn reply(&self, value: Value) -> Result<()> {
        self.ch.reply(value)
    }

    /// Send one data message.
    pub fn data(&self, payload: impl Into<Payload>) -> Result<()> {
        self.ch.data(&payload.into())
    }

    /// Send one log message on the diagnostic side-channel.
    pub fn log(&self, payload: impl Into<Payload>) -> Result<()> {
        self.ch.log(&payload.into())
    }

    /// Log an error as a structured `{"error": ...}` record.
    pub fn log_error(&self, message: &str) -> Result<()> {
        self.ch.log(&Payload::Json(json!({ "error": message })))
    }

    /// Signal that this side will send no more data.
    pub fn fin(&self) -> Result<()> {
        self.ch.fin()
    }

    /// Finish the invocation. An error here surfaces at the peer as a remote
    /// error. Idempotent.
    pub fn close(&self, error: Option<String>) {
        self.ch.close(error)
    }

    /// Receive the next data message; `None` once the inbound stream ended.
    pub fn recv_data(&self) -> Option<Payload> {
        self.ch.data_rx.lock().expect("data queue lock poisoned").recv().ok()
    }

    /// Receive the next data message, bounded by `timeout`.
    ///
    /// `Ok(None)` means the stream ended; `Err(Timeout)` that nothing arrived
    /// in time.
    pub fn recv_data_timeout(&self, timeout: Duration) -> Result<Option<Payload>> {
        match self
            .ch
            .data_rx
            .lock()
            .expect("data queue lock poisoned")
            .recv_timeout(timeout)
        {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(ProtoError::Timeout(timeout)),
        }
    }

    /// Receive the next log message; `None` once the channel is gone.
    pub fn recv_log(&self) -> Option<Payload> {
        self.ch.log_rx.lock().expect("log queue lock poisoned").recv().ok()
    }

    /// Receive the next log message, bounded by `timeout`.
    pub fn recv_log_timeout(&self, timeout: Duration) -> Result<Option<Payload>> {
        match self
            .ch
            .log_rx
            .lock()
            .expect("log queue lock poisoned")
            .recv_timeout(timeout)
        {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(ProtoError::Timeout(timeout)),
        }
    }

    /// Wait for the one-shot call outcome and map it to a reply.
    pub fn wait_reply(&self, timeout: Duration) -> Result<Value> {
        match self.ch.outcome.wait(timeout)? {
            CallOutcome::Reply(value) => Ok(value),
            CallOutcome::RemoteError(err) => Err(ProtoError::Remote(err)),
            CallOutcome::Closed => Err(ProtoError::ChannelClosed),
            CallOutcome::Failed(err) => Err(err.clone_shallow()),
        }
    }

    pub(crate) fn wait_outcome_blocking(&self) -> CallOutcome {
        self.ch.outcome.wait_blocking()
    }

    /// Block until the channel reaches its terminal state.
    pub fn wait_closed(&self) {
        self.ch.closed.wait()
    }

    /// Wait for the terminal state, bounded by `timeout`.
    pub fn wait_closed_timeout(&self, timeout: Duration) -> bool {
        self.ch.closed.wait_timeout(timeout)
    }

    /// Whether the channel has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.ch.closed.is_open()
    }

    /// The error the peer closed with, if any.
    pub fn remote_error(&self) -> Option<String> {
        self.ch.remote_error()
    }

    /// The error this channel terminated with, local or remote.
    pub fn terminal_error(&self) -> Option<String> {
        self.ch.terminal_error()
    }
}

impl std::fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIo")
            .field("id", &self.ch.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
