//! Peer sessions.
//!
//! A [`Peer`] owns one multiplexed session to one remote endpoint and runs
//! two persistent loops:
//!
//!   - Send loop: dequeues a message, opens a fresh sub-stream, writes one
//!     frame, closes the sub-stream. Errors are logged and the message is
//!     dropped; there is no retry at this layer.
//!   - Receive loop: accepts sub-streams and spawns a short-lived read task
//!     per stream that reads one frame, enforces the sender-host check, and
//!     routes the message (RPC replies to their waiting request, everything
//!     else to the incoming channel).
//!
//! Request/reply correlation uses a oneshot channel per pending request,
//! keyed by a monotonically increasing rpc id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::Error;
use crate::mux::{MuxSession, SubStream};
use crate::proto::Envelope;
use crate::wire;

/// Capacity of the incoming message channel consumed by the controller.
const INCOMING_CAPACITY: usize = 256;

/// One remote endpoint and the multiplexed session to it.
pub struct Peer {
    /// Remote advertise address. Inbound peers start at the zero sentinel
    /// and are latched by the controller on their first validated message.
    remote: RwLock<Address>,
    /// IP the underlying connection actually talks to; every decoded sender
    /// must claim this host.
    transport_host: String,
    inbound: bool,
    mux: MuxSession,
    outgoing_tx: mpsc::UnboundedSender<Envelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    next_rpc_id: AtomicU64,
}

impl Peer {
    /// Start a session over an established multiplexed connection.
    ///
    /// Returns the peer and the channel of non-reply messages it receives.
    pub(crate) fn spawn(
        mux: MuxSession,
        sub_streams: mpsc::Receiver<SubStream>,
        remote: Address,
        transport_host: String,
        inbound: bool,
    ) -> (Arc<Peer>, mpsc::Receiver<Envelope>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        let peer = Arc::new(Peer {
            remote: RwLock::new(remote),
            transport_host,
            inbound,
            mux,
            outgoing_tx,
            pending: Mutex::new(HashMap::new()),
            next_rpc_id: AtomicU64::new(1),
        });

        tokio::spawn(send_loop(peer.clone(), outgoing_rx));
        tokio::spawn(receive_loop(peer.clone(), sub_streams, incoming_tx));

        (peer, incoming_rx)
    }

    /// The remote's advertise address (zero sentinel until latched).
    pub fn remote(&self) -> Address {
        self.remote.read().expect("remote lock").clone()
    }

    pub(crate) fn set_remote(&self, remote: Address) {
        *self.remote.write().expect("remote lock") = remote;
    }

    /// Whether the remote dialed us.
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Enqueue a message for delivery. Never blocks; fire-and-forget.
    pub fn queue_message(&self, message: Envelope) {
        if self.outgoing_tx.send(message).is_err() {
            debug!(remote = %self.remote(), "send queue closed, dropping message");
        }
    }

    /// Enqueue `message` as the reply to the request carrying `rpc_id`.
    pub fn queue_reply(&self, rpc_id: u64, mut message: Envelope) {
        message.rpc_id = rpc_id;
        message.is_reply = true;
        self.queue_message(message);
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// On timeout the pending entry is removed and any later reply is
    /// dropped silently.
    pub async fn request(&self, mut message: Envelope, timeout: Duration) -> Result<Envelope, Error> {
        let rpc_id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        message.rpc_id = rpc_id;
        message.is_request = true;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(rpc_id, reply_tx);

        if self.outgoing_tx.send(message).is_err() {
            self.remove_pending(rpc_id);
            return Err(Error::Shutdown);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.remove_pending(rpc_id);
                Err(Error::Shutdown)
            }
            Err(_) => {
                self.remove_pending(rpc_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Close the session. Idempotent; the controller's cleanup watcher
    /// observes the close exactly once.
    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolves when the session has closed, for any reason.
    pub async fn closed(&self) {
        self.mux.closed().await;
    }

    fn remove_pending(&self, rpc_id: u64) {
        self.pending.lock().expect("pending lock").remove(&rpc_id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

async fn send_loop(peer: Arc<Peer>, mut outgoing_rx: mpsc::UnboundedReceiver<Envelope>) {
    loop {
        tokio::select! {
            _ = peer.mux.closed() => break,
            queued = outgoing_rx.recv() => {
                let Some(envelope) = queued else { break };
                if let Err(e) = send_one(&peer.mux, &envelope).await {
                    debug!(remote = %peer.remote(), kind = %envelope.kind, error = %e,
                        "dropping outbound message");
                }
            }
        }
    }
}

async fn send_one(mux: &MuxSession, envelope: &Envelope) -> Result<(), Error> {
    let mut stream = mux.open().await?;
    wire::write_frame(&mut stream, envelope).await?;
    stream.close().await.map_err(crate::error::WireError::Io)?;
    Ok(())
}

async fn receive_loop(
    peer: Arc<Peer>,
    mut sub_streams: mpsc::Receiver<SubStream>,
    incoming_tx: mpsc::Sender<Envelope>,
) {
    loop {
        tokio::select! {
            _ = peer.mux.closed() => break,
            accepted = sub_streams.recv() => {
                let Some(stream) = accepted else { break };
                tokio::spawn(read_sub_stream(peer.clone(), stream, incoming_tx.clone()));
            }
        }
    }
}

/// Read the one message a sub-stream carries and route it.
///
/// Per-message failures drop only this sub-stream; a sender-host mismatch
/// closes the whole session.
async fn read_sub_stream(peer: Arc<Peer>, mut stream: SubStream, incoming_tx: mpsc::Sender<Envelope>) {
    let envelope = match wire::read_frame(&mut stream).await {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(remote = %peer.remote(), error = %e, "dropping sub-stream");
            return;
        }
    };
    drop(stream);

    if let Err(e) = check_sender(&envelope, &peer.transport_host) {
        warn!(error = %e, "closing session");
        peer.close();
        return;
    }

    if envelope.is_reply {
        let waiter = peer
            .pending
            .lock()
            .expect("pending lock")
            .remove(&envelope.rpc_id);
        match waiter {
            Some(reply_tx) => {
                let _ = reply_tx.send(envelope);
            }
            None => debug!(rpc_id = envelope.rpc_id, "late reply dropped"),
        }
    } else if incoming_tx.send(envelope).await.is_err() {
        debug!(remote = %peer.remote(), "incoming channel closed, dropping message");
    }
}

/// A message must claim the host its bytes actually came from.
fn check_sender(envelope: &Envelope, transport_host: &str) -> Result<(), Error> {
    match envelope.sender.parse::<Address>() {
        Ok(claimed) if claimed.host() == transport_host => Ok(()),
        _ => Err(Error::SenderMismatch {
            transport: transport_host.to_string(),
            claimed: envelope.sender.clone(),
        }),
    }
}
