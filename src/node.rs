//! The node controller.
//!
//! A [`Node`] owns the peer registry, runs the listener accepting inbound
//! connections, dispatches inbound messages through the framework's
//! validator to plugin callbacks, and issues broadcasts. Handles are cheap
//! clones; background tasks hold [`WeakNode`] references so dropping the
//! last user handle releases the controller.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use rand::seq::index::sample;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::config::NodeConfig;
use crate::context::{MessageContext, NetworkContext, PeerContext};
use crate::error::Error;
use crate::events::{NetworkEvent, PeerEvent};
use crate::framework::{Framework, GenericFramework};
use crate::mux::MuxSession;
use crate::peer::Peer;
use crate::plugin::Plugin;
use crate::proto::Envelope;

/// Delay between binding the listener and latching "started".
const STARTUP_WARMUP: Duration = Duration::from_secs(1);

/// Handle to a running node. Clones share the same controller.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

/// Non-owning handle held by background tasks; upgrading fails once the
/// last [`Node`] is dropped.
#[derive(Clone)]
pub struct WeakNode {
    shared: Weak<Shared>,
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.shared.upgrade().map(|shared| Node { shared })
    }
}

struct Shared {
    config: NodeConfig,
    framework: Arc<dyn Framework>,
    plugins: std::sync::RwLock<Vec<Arc<dyn Plugin>>>,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    started_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last user handle gone: end the accept loop and release every
        // session so background tasks can exit.
        self.shutdown.cancel();
        for peer in self.peers.get_mut().values() {
            peer.close();
        }
    }
}

impl Node {
    /// Create a node. Without a framework the [`GenericFramework`] is
    /// installed: every message validates and dialed peers get an
    /// introduction.
    pub fn new(config: NodeConfig, framework: Option<Arc<dyn Framework>>) -> Self {
        let framework = framework.unwrap_or_else(|| Arc::new(GenericFramework));
        let (started_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                framework,
                plugins: std::sync::RwLock::new(Vec::new()),
                peers: RwLock::new(HashMap::new()),
                started_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The address this node advertises as its sender.
    pub fn me(&self) -> Address {
        self.shared.config.advertise_address.clone()
    }

    /// Build an envelope stamped with this node's advertise address.
    pub fn new_message(&self, kind: &str, body: Vec<u8>) -> Envelope {
        Envelope::new(self.me().to_string(), kind, body)
    }

    /// Register a plugin. Invocation order is registration order; plugins
    /// must be registered before [`listen`](Node::listen).
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.shared.plugins.write().expect("plugin lock").push(plugin);
    }

    /// Blocks until [`listen`](Node::listen) has latched "started".
    pub async fn started(&self) {
        let mut started_rx = self.shared.started_tx.subscribe();
        let _ = started_rx.wait_for(|started| *started).await;
    }

    /// Bind the listener and accept inbound connections until
    /// [`stop`](Node::stop).
    ///
    /// Fires the startup event, latches "started" after a short warm-up,
    /// and fires the close event on the way out. Returns an error only if
    /// binding fails.
    pub async fn listen(&self) -> Result<(), Error> {
        self.shared.framework.configure(self);

        let bind = self.shared.config.bind_address.clone();
        let listener = TcpListener::bind(bind.socket_string())
            .await
            .map_err(|source| Error::Bind {
                address: bind.clone(),
                source,
            })?;
        info!(address = %bind, "listening");

        self.fire_network_event(NetworkEvent::Startup).await;

        let started_tx = self.shared.started_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_WARMUP).await;
            let _ = started_tx.send(true);
        });

        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "inbound connection");
                        self.handle_new_connection(stream, remote.ip().to_string());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        self.fire_network_event(NetworkEvent::Close).await;
        Ok(())
    }

    /// Close the listener. Ongoing sessions drain naturally.
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
    }

    /// Dial and register each address that is not self and not already
    /// registered. All addresses get a dial attempt; failures are
    /// accumulated into one aggregate error.
    pub async fn add_peer(&self, addresses: &[Address]) -> Result<(), Error> {
        let mut failures = Vec::new();
        for address in addresses {
            if *address == self.me() {
                continue;
            }
            if self.peer_exists(address).await {
                continue;
            }
            if let Err(e) = self.dial(address).await {
                warn!(address = %address, error = %e, "dial failed");
                failures.push(e);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    /// Close matching sessions and drop their registry entries.
    pub async fn delete_peer(&self, addresses: &[Address]) {
        for address in addresses {
            let removed = self.shared.peers.write().await.remove(address);
            if let Some(peer) = removed {
                peer.close();
            }
        }
    }

    /// Send a message to the named peers, or to every registered peer when
    /// `addresses` is empty. Unregistered named peers are dialed first.
    pub async fn broadcast(&self, message: &Envelope, addresses: &[Address]) {
        self.started().await;

        if addresses.is_empty() {
            for peer in self.peers().await {
                peer.queue_message(message.clone());
            }
            return;
        }

        for address in addresses {
            if let Some(peer) = self.peer(address).await {
                peer.queue_message(message.clone());
                continue;
            }
            if let Err(e) = self.add_peer(std::slice::from_ref(address)).await {
                warn!(address = %address, error = %e, "broadcast target unreachable");
                continue;
            }
            if let Some(peer) = self.peer(address).await {
                peer.queue_message(message.clone());
            }
        }
    }

    /// Send a message to `n` distinct peers sampled uniformly without
    /// replacement. Degenerates to a full broadcast when `n` is at most 1
    /// or covers the whole registry.
    pub async fn broadcast_random(&self, message: &Envelope, n: usize) {
        self.started().await;

        let peers = self.peers().await;
        if n <= 1 || n >= peers.len() {
            for peer in &peers {
                peer.queue_message(message.clone());
            }
            return;
        }

        let mut rng = rand::thread_rng();
        for index in sample(&mut rng, peers.len(), n) {
            peers[index].queue_message(message.clone());
        }
    }

    /// Send a request to the peer at `address`, dialing it first if it is
    /// not registered, and wait up to `timeout` for the reply.
    pub async fn request(
        &self,
        message: Envelope,
        timeout: Duration,
        address: &Address,
    ) -> Result<Envelope, Error> {
        let peer = match self.peer(address).await {
            Some(peer) => peer,
            None => {
                self.add_peer(std::slice::from_ref(address)).await?;
                self.peer(address).await.ok_or(Error::Shutdown)?
            }
        };
        peer.request(message, timeout).await
    }

    /// Invoke `f` on each live peer.
    pub async fn do_all_peers<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Peer>),
    {
        for peer in self.peers().await {
            f(&peer);
        }
    }

    /// Snapshot of all registered peers.
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared.peers.read().await.values().cloned().collect()
    }

    pub async fn peer(&self, address: &Address) -> Option<Arc<Peer>> {
        self.shared.peers.read().await.get(address).cloned()
    }

    pub async fn peer_exists(&self, address: &Address) -> bool {
        self.shared.peers.read().await.contains_key(address)
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.read().await.len()
    }

    async fn dial(&self, address: &Address) -> Result<(), Error> {
        let stream = TcpStream::connect(address.socket_string())
            .await
            .map_err(|source| Error::Dial {
                address: address.clone(),
                source,
            })?;
        let transport_host = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| address.host().to_string());

        let (mux, sub_streams) = MuxSession::client(stream);
        let (peer, incoming) =
            Peer::spawn(mux, sub_streams, address.clone(), transport_host, false);

        self.spawn_message_listener(peer.clone(), incoming);
        if !self.register_peer(peer.clone()).await {
            // Lost a registration race for this address; only one session
            // per remote may live in the registry.
            peer.close();
        }
        Ok(())
    }

    fn handle_new_connection(&self, stream: TcpStream, transport_host: String) {
        let (mux, sub_streams) = MuxSession::server(stream);
        let (peer, incoming) = Peer::spawn(
            mux,
            sub_streams,
            Address::default(),
            transport_host,
            true,
        );
        // Inbound peers stay out of the registry until their first
        // validated message identifies them.
        self.spawn_message_listener(peer, incoming);
    }

    /// Store a peer under its remote address. Returns false if the address
    /// is already registered.
    async fn register_peer(&self, peer: Arc<Peer>) -> bool {
        let remote = peer.remote();
        {
            let mut peers = self.shared.peers.write().await;
            match peers.entry(remote.clone()) {
                Entry::Occupied(_) => {
                    debug!(remote = %remote, "peer already registered");
                    return false;
                }
                Entry::Vacant(slot) => {
                    slot.insert(peer.clone());
                }
            }
        }
        info!(remote = %remote, inbound = peer.is_inbound(), "peer added");

        self.spawn_cleanup_watcher(peer.clone());
        self.fire_peer_event(PeerEvent::Added, peer).await;
        true
    }

    fn spawn_message_listener(&self, peer: Arc<Peer>, mut incoming: mpsc::Receiver<Envelope>) {
        let weak = self.downgrade();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = peer.closed() => break,
                    received = incoming.recv() => {
                        let Some(envelope) = received else { break };
                        let Some(node) = weak.upgrade() else { break };
                        node.dispatch(&peer, envelope).await;
                    }
                }
            }
        });
    }

    /// Remove the peer from the registry when its session closes and fire
    /// peer-disconnect exactly once.
    fn spawn_cleanup_watcher(&self, peer: Arc<Peer>) {
        let weak = self.downgrade();
        tokio::spawn(async move {
            peer.closed().await;
            let Some(node) = weak.upgrade() else { return };

            let remote = peer.remote();
            {
                let mut peers = node.shared.peers.write().await;
                // A new session may already be registered under the same
                // address; only remove the one this watcher owns.
                if peers
                    .get(&remote)
                    .is_some_and(|stored| Arc::ptr_eq(stored, &peer))
                {
                    peers.remove(&remote);
                }
            }
            info!(remote = %remote, "peer disconnected");
            node.fire_peer_event(PeerEvent::Disconnected, peer).await;
        });
    }

    /// Validate, latch inbound peers, and fan the message out.
    async fn dispatch(&self, peer: &Arc<Peer>, envelope: Envelope) {
        let sender = match envelope.sender.parse::<Address>() {
            Ok(sender) if sender.is_valid() => sender,
            _ => {
                debug!(sender = %envelope.sender, "dropping message with invalid sender");
                return;
            }
        };

        let ctx = MessageContext {
            node: self.clone(),
            message: envelope,
            sender: sender.clone(),
        };

        if !self.shared.framework.validate_message(&ctx).await {
            debug!(kind = %ctx.message.kind, sender = %sender, "message rejected by validator");
            return;
        }

        // An inbound peer's first validated message identifies it.
        if peer.is_inbound() && !peer.remote().is_valid() {
            peer.set_remote(sender);
            self.register_peer(peer.clone()).await;
        }

        self.fire_message_event(ctx);
    }

    /// Fan a validated message out to the framework and every plugin, one
    /// task per callback.
    fn fire_message_event(&self, ctx: MessageContext) {
        let framework = self.shared.framework.clone();
        let framework_ctx = ctx.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(framework.new_message(framework_ctx))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("framework new_message callback panicked");
            }
        });

        for plugin in self.plugins() {
            let plugin_ctx = ctx.clone();
            tokio::spawn(async move {
                if AssertUnwindSafe(plugin.new_message(plugin_ctx))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("plugin new_message callback panicked");
                }
            });
        }
    }

    /// Peer events run to completion before the caller proceeds, so
    /// peer-added always lands before the message that latched the peer.
    async fn fire_peer_event(&self, event: PeerEvent, peer: Arc<Peer>) {
        let ctx = PeerContext {
            node: self.clone(),
            is_incoming: peer.is_inbound(),
            peer,
        };

        match event {
            PeerEvent::Added => {
                isolate(self.shared.framework.peer_added(ctx.clone()), "peer_added").await;
                for plugin in self.plugins() {
                    isolate(plugin.peer_added(ctx.clone()), "peer_added").await;
                }
            }
            PeerEvent::Disconnected => {
                isolate(
                    self.shared.framework.peer_disconnect(ctx.clone()),
                    "peer_disconnect",
                )
                .await;
                for plugin in self.plugins() {
                    isolate(plugin.peer_disconnect(ctx.clone()), "peer_disconnect").await;
                }
            }
        }
    }

    async fn fire_network_event(&self, event: NetworkEvent) {
        let ctx = NetworkContext { node: self.clone() };
        match event {
            NetworkEvent::Startup => {
                isolate(self.shared.framework.startup(ctx.clone()), "startup").await;
                for plugin in self.plugins() {
                    isolate(plugin.startup(ctx.clone()), "startup").await;
                }
            }
            NetworkEvent::Close => {
                isolate(self.shared.framework.close(ctx.clone()), "close").await;
                for plugin in self.plugins() {
                    isolate(plugin.close(ctx.clone()), "close").await;
                }
            }
        }
    }

    fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.shared.plugins.read().expect("plugin lock").clone()
    }
}

/// Run a callback, containing any panic so plugin bugs cannot corrupt the
/// controller.
async fn isolate<F>(callback: F, name: &str)
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
        error!(callback = name, "callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(port: u16) -> Node {
        let address = Address::new("127.0.0.1", port);
        Node::new(NodeConfig::same(address), None)
    }

    #[tokio::test]
    async fn node_starts_with_empty_registry() {
        let node = test_node(6000);
        assert_eq!(node.peer_count().await, 0);
        assert_eq!(node.me(), Address::new("127.0.0.1", 6000));
    }

    #[tokio::test]
    async fn new_message_stamps_advertise_address() {
        let node = test_node(6001);
        let message = node.new_message("test", vec![1, 2]);
        assert_eq!(message.sender, "127.0.0.1:6001");
        assert_eq!(message.kind, "test");
        assert_eq!(message.body, vec![1, 2]);
    }

    #[tokio::test]
    async fn add_peer_on_self_is_a_no_op() {
        let node = test_node(6002);
        node.add_peer(&[node.me()]).await.unwrap();
        assert_eq!(node.peer_count().await, 0);
    }

    #[tokio::test]
    async fn add_peer_aggregates_dial_failures() {
        let node = test_node(6003);
        // Nothing listens on these ports.
        let unreachable = [
            Address::new("127.0.0.1", 1),
            Address::new("127.0.0.1", 2),
        ];
        let err = node.add_peer(&unreachable).await.unwrap_err();
        match err {
            Error::Aggregate(failures) => assert_eq!(failures.len(), 2),
            other => panic!("expected aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn weak_node_drops_with_last_handle() {
        let node = test_node(6004);
        let weak = node.downgrade();
        assert!(weak.upgrade().is_some());
        drop(node);
        assert!(weak.upgrade().is_none());
    }
}
