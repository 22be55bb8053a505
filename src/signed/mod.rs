//! Signed-message framework.
//!
//! Authenticates the sender of every inbound message with a recoverable
//! secp256k1 signature over the inner record, maintains an XOR-distance
//! routing table of authenticated identities, and overlays a minimal
//! discovery protocol:
//!
//! - `dht.ping`: answered with `dht.pong`
//! - `dht.pong`: triggers a closest-peer refresh
//! - `dht.lookup_request` / `dht.lookup_response`: closest-K exchange
//!
//! Anything else lands on the framework's user-facing receive channel.

pub mod id;
pub mod identity;
pub mod proto;
pub mod router;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::Address;
use crate::context::{MessageContext, PeerContext};
use crate::error::Error;
use crate::framework::Framework;
use crate::node::{Node, WeakNode};
use crate::proto::Envelope;

use id::NodeId;
use identity::{keccak256, recover_address, Identity, ADDRESS_LEN};
use proto::{LookupRequest, LookupResponse, NodeRecord, Record, SignedRecord};
use router::{RoutingTable, BUCKET_SIZE};

const PING_KIND: &str = "dht.ping";
const PONG_KIND: &str = "dht.pong";
const LOOKUP_REQUEST_KIND: &str = "dht.lookup_request";
const LOOKUP_RESPONSE_KIND: &str = "dht.lookup_response";

/// How long a closest-peer lookup waits for each reply.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the user-facing receive channel.
const INCOMING_CAPACITY: usize = 256;

/// Decides whether a recovered 20-byte address is admissible.
pub type AddressValidator = dyn Fn(&[u8; ADDRESS_LEN]) -> bool + Send + Sync;

/// A validated non-protocol message, as seen by the application.
#[derive(Debug)]
pub struct IncomingMessage {
    pub sender: NodeId,
    pub body: Vec<u8>,
    pub kind: String,
}

/// Framework that only admits messages carrying a valid signature from an
/// acceptable address.
pub struct SignedFramework {
    identity: Identity,
    address_validator: Box<AddressValidator>,
    node: OnceLock<WeakNode>,
    router: OnceLock<RoutingTable>,
    /// Authenticated id per transport address, for disconnect cleanup.
    id_map: Mutex<HashMap<Address, NodeId>>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

impl SignedFramework {
    /// Create a framework around a signing identity. Without a validator
    /// every recovered address is acceptable.
    pub fn new(identity: Identity, address_validator: Option<Box<AddressValidator>>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            identity,
            address_validator: address_validator.unwrap_or_else(|| Box::new(|_| true)),
            node: OnceLock::new(),
            router: OnceLock::new(),
            id_map: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// The local 20-byte address.
    pub fn address(&self) -> [u8; ADDRESS_LEN] {
        self.identity.address()
    }

    /// The routing table, once the node has configured the framework.
    pub fn routing_table(&self) -> Option<&RoutingTable> {
        self.router.get()
    }

    /// Take the receive channel of validated non-protocol messages. Yields
    /// once; later calls return None.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.incoming_rx.lock().expect("incoming lock").take()
    }

    /// Ping every connected peer so they learn this node and discovery can
    /// proceed.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        let message = self.make_signed_message(PING_KIND, Vec::new())?;
        self.node()?.broadcast(&message, &[]).await;
        Ok(())
    }

    /// Send a signed message of `kind` to the node owning `recipient`.
    ///
    /// The recipient must already be in the routing table; run discovery
    /// first otherwise.
    pub async fn send_message(
        &self,
        recipient: &[u8; ADDRESS_LEN],
        kind: &str,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        let router = self.router.get().ok_or(Error::Shutdown)?;
        let target = NodeId::new(recipient.to_vec(), String::new());

        let closest = router.find_closest(&target, 1);
        let peer = match closest.into_iter().next() {
            Some(peer) if peer.address[..] == recipient[..] => peer,
            _ => return Err(Error::NotFound),
        };

        let address: Address = peer.network_address.parse()?;
        let message = self.make_signed_message(kind, body)?;
        self.node()?
            .broadcast(&message, std::slice::from_ref(&address))
            .await;
        Ok(())
    }

    /// Ask the closest known peers for the ids closest to `target` and
    /// merge the answers, closest first, at most `count`.
    pub async fn find_peers(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        let Some(router) = self.router.get() else {
            return Vec::new();
        };
        let Ok(node) = self.node() else {
            return Vec::new();
        };

        let request_body = LookupRequest {
            target: Some(NodeRecord::from(target.clone())),
        }
        .encode_to_vec();

        let mut lookups = Vec::new();
        for peer in router.find_closest(target, count) {
            let Ok(message) = self.make_signed_message(LOOKUP_REQUEST_KIND, request_body.clone())
            else {
                continue;
            };
            let node = node.clone();
            lookups.push(async move {
                let address: Address = match peer.network_address.parse() {
                    Ok(address) => address,
                    Err(_) => return Vec::new(),
                };
                match node.request(message, LOOKUP_TIMEOUT, &address).await {
                    Ok(reply) => parse_lookup_reply(&reply),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "lookup request was not answered");
                        Vec::new()
                    }
                }
            });
        }

        let mut merged: Vec<NodeId> = futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect();
        merged.sort_by(|a, b| a.distance(target).cmp(&b.distance(target)));
        merged.truncate(count);
        merged
    }

    /// Build a signed envelope of `kind` around `body`.
    pub fn make_signed_message(&self, kind: &str, body: Vec<u8>) -> Result<Envelope, Error> {
        let node = self.node()?;
        let router = self.router.get().ok_or(Error::Shutdown)?;

        let inner = Record {
            sender: Some(NodeRecord::from(router.self_id().clone())),
            body,
        }
        .encode_to_vec();
        let signature = self.identity.sign(&keccak256(&inner))?;

        let signed = SignedRecord {
            inner,
            signature: signature.to_vec(),
        };
        Ok(node.new_message(kind, signed.encode_to_vec()))
    }

    fn node(&self) -> Result<Node, Error> {
        self.node
            .get()
            .and_then(WeakNode::upgrade)
            .ok_or(Error::Shutdown)
    }

    /// Refresh the routing table from the network after a pong.
    async fn refresh_routes(&self) {
        let Some(router) = self.router.get() else {
            return;
        };
        let self_id = router.self_id().clone();
        for found in self.find_peers(&self_id, BUCKET_SIZE).await {
            router.update(found);
        }
    }

    async fn answer_lookup(&self, ctx: &MessageContext, body: &[u8]) {
        let Some(router) = self.router.get() else {
            return;
        };
        let Ok(request) = LookupRequest::decode(body) else {
            return;
        };
        let Some(target) = request.target else {
            return;
        };

        let response = LookupResponse {
            peers: router
                .find_closest(&NodeId::from(target), BUCKET_SIZE)
                .into_iter()
                .map(NodeRecord::from)
                .collect(),
        }
        .encode_to_vec();

        match self.make_signed_message(LOOKUP_RESPONSE_KIND, response) {
            Ok(reply) => ctx.reply(reply).await,
            Err(e) => debug!(error = %e, "could not sign lookup response"),
        }
    }
}

#[async_trait]
impl Framework for SignedFramework {
    fn configure(&self, node: &Node) {
        let _ = self.node.set(node.downgrade());
        let self_id = NodeId::new(self.identity.address().to_vec(), node.me().to_string());
        let _ = self.router.set(RoutingTable::new(self_id));
    }

    async fn validate_message(&self, ctx: &MessageContext) -> bool {
        let Ok(signed) = SignedRecord::decode(ctx.message.body.as_slice()) else {
            return false;
        };
        let Ok(inner) = Record::decode(signed.inner.as_slice()) else {
            return false;
        };
        let Some(sender) = inner.sender else {
            return false;
        };

        let digest = keccak256(&signed.inner);
        let Ok(recovered) = recover_address(&digest, &signed.signature) else {
            return false;
        };
        if sender.address[..] != recovered[..] {
            return false;
        }

        // The signed network address must be the one the envelope came
        // from; a signer claiming someone else's transport is evicted.
        let Ok(advertised) = sender.network_address.parse::<Address>() else {
            return false;
        };
        if advertised != ctx.sender {
            warn!(
                signed = %advertised,
                transport = %ctx.sender,
                "signed network address mismatch, evicting peer"
            );
            ctx.node
                .delete_peer(std::slice::from_ref(&ctx.sender))
                .await;
            return false;
        }

        (self.address_validator)(&recovered)
    }

    async fn new_message(&self, ctx: MessageContext) {
        let Ok(signed) = SignedRecord::decode(ctx.message.body.as_slice()) else {
            return;
        };
        let Ok(inner) = Record::decode(signed.inner.as_slice()) else {
            return;
        };
        let Some(sender) = inner.sender else {
            return;
        };
        let sender_id = NodeId::from(sender);

        // Every validated message keeps the table fresh.
        if let Some(router) = self.router.get() {
            router.update(sender_id.clone());
        }
        self.id_map
            .lock()
            .expect("id map lock")
            .insert(ctx.sender.clone(), sender_id.clone());

        match ctx.message.kind.as_str() {
            PING_KIND => match self.make_signed_message(PONG_KIND, Vec::new()) {
                Ok(reply) => ctx.reply(reply).await,
                Err(e) => debug!(error = %e, "could not sign pong"),
            },
            PONG_KIND => self.refresh_routes().await,
            LOOKUP_REQUEST_KIND => self.answer_lookup(&ctx, &inner.body).await,
            _ => {
                let incoming = IncomingMessage {
                    sender: sender_id,
                    body: inner.body,
                    kind: ctx.message.kind.clone(),
                };
                if self.incoming_tx.send(incoming).await.is_err() {
                    debug!(kind = %ctx.message.kind, "receive channel closed, dropping message");
                }
            }
        }
    }

    async fn peer_disconnect(&self, ctx: PeerContext) {
        let removed = self
            .id_map
            .lock()
            .expect("id map lock")
            .remove(&ctx.peer.remote());
        if let (Some(id), Some(router)) = (removed, self.router.get()) {
            router.remove(&id);
        }
    }
}

fn parse_lookup_reply(reply: &Envelope) -> Vec<NodeId> {
    let Ok(signed) = SignedRecord::decode(reply.body.as_slice()) else {
        return Vec::new();
    };
    let Ok(inner) = Record::decode(signed.inner.as_slice()) else {
        return Vec::new();
    };
    let Ok(response) = LookupResponse::decode(inner.body.as_slice()) else {
        return Vec::new();
    };
    response.peers.into_iter().map(NodeId::from).collect()
}
