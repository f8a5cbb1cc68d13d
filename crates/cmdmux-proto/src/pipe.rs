//! Channel splicing for transparent forwarding.
//!
//! `pipe` bridges two channels so a Router can forward an invocation without
//! touching payload semantics: Data and Log cross both ways, the outbound
//! Reply is mirrored inward, and a Close on either side (with its error, so
//! remote blame stays remote) tears the other down.

use tracing::debug;

use crate::channel::{CallOutcome, ChannelIo};

/// Splice `inbound` (the locally invoked channel) to `outbound` (the real
/// command on the remote peer).
pub fn pipe(inbound: &ChannelIo, outbound: &ChannelIo) {
    bridge_data(inbound.clone(), outbound.clone());
    bridge_data(outbound.clone(), inbound.clone());
    bridge_log(inbound.clone(), outbound.clone());
    bridge_log(outbound.clone(), inbound.clone());
    mirror_reply(inbound.clone(), outbound.clone());
    propagate_close(inbound.clone(), outbound.clone());
    propagate_close(outbound.clone(), inbound.clone());
}

fn spawn_worker(f: impl FnOnce() + Send + 'static) {
    if std::thread::Builder::new()
        .name("cmdmux-pipe".to_string())
        .spawn(f)
        .is_err()
    {
        debug!("failed to spawn pipe worker");
    }
}

fn bridge_data(from: ChannelIo, to: ChannelIo) {
    spawn_worker(move || {
        while let Some(payload) = from.recv_data() {
            if to.data(payload).is_err() {
                return;
            }
        }
        let _ = to.fin();
    });
}

fn bridge_log(from: ChannelIo, to: ChannelIo) {
    spawn_worker(move || {
        while let Some(payload) = from.recv_log() {
            if to.log(payload).is_err() {
                return;
            }
        }
    });
}

fn mirror_reply(inbound: ChannelIo, outbound: ChannelIo) {
    spawn_worker(move || match outbound.wait_outcome_blocking() {
        CallOutcome::Reply(value) => {
            let _ = inbound.reply(value);
        }
        CallOutcome::RemoteError(err) => inbound.close(Some(err)),
        CallOutcome::Closed => {}
        CallOutcome::Failed(err) => inbound.close(Some(err.to_string())),
    });
}

fn propagate_close(from: ChannelIo, to: ChannelIo) {
    spawn_worker(move || {
        from.wait_closed();
        to.close(from.terminal_error());
    });
}
