use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tokio::{
    net::UdpSocket,
    sync::{RwLock, mpsc, oneshot},
    task::AbortHandle,
};
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};

use crate::punchgate::{
    context::ProxyContext,
    ids::PeerId,
    net,
    punch::attempt::{self, PunchError, PunchOutcome, PunchPlan},
    rendezvous::protocol::{self, HangoutMessage, HangoutRequest, Inbound, PunchRelay},
    telemetry,
    tunnel::mux::Multiplexer,
};

/// Which half of a peer pairing a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the remote's server node and carries our outbound requests.
    Client,
    /// Accepts the remote's client node and forwards its requests locally.
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Started,
    AlreadyPunching,
    UnknownPeer,
}

/// Everything this node holds for one remote peer.
///
/// Each node socket is owned by its node task; dropping the state aborts
/// those tasks, which closes both nodes.
struct PeerState {
    generation: u64,
    hangout: SocketAddr,
    client_local: SocketAddr,
    server_local: SocketAddr,
    /// Hands a relay that arrived on the rendezvous socket to the idle node task.
    client_relay: Option<oneshot::Sender<String>>,
    server_relay: Option<oneshot::Sender<String>>,
    is_client_punching: bool,
    is_server_punching: bool,
    link_id: Option<u64>,
    created_unix_ms: u64,
    tasks: Vec<AbortHandle>,
}

impl PeerState {
    fn role_mut(&mut self, role: Role) -> (&mut bool, &mut Option<oneshot::Sender<String>>) {
        match role {
            Role::Client => (&mut self.is_client_punching, &mut self.client_relay),
            Role::Server => (&mut self.is_server_punching, &mut self.server_relay),
        }
    }
}

impl Drop for PeerState {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub generation: u64,
    pub hangout: SocketAddr,
    pub client_node: SocketAddr,
    pub server_node: SocketAddr,
    pub is_client_punching: bool,
    pub is_server_punching: bool,
    pub established: bool,
    pub created_unix_ms: u64,
}

pub struct HolePuncher {
    ctx: Arc<ProxyContext>,
    mux: Arc<Multiplexer>,
    kcp: KcpConfig,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    next_generation: AtomicU64,
    fatal: mpsc::UnboundedSender<anyhow::Error>,
}

impl HolePuncher {
    pub fn new(
        ctx: Arc<ProxyContext>,
        mux: Arc<Multiplexer>,
        fatal: mpsc::UnboundedSender<anyhow::Error>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            mux,
            kcp: KcpConfig::default(),
            peers: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            fatal,
        })
    }

    pub async fn is_tracked(&self, peer: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer)
    }

    pub async fn tracked_peers(&self) -> HashSet<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read().await;
        let mut out = peers
            .iter()
            .map(|(peer, st)| PeerSnapshot {
                peer: peer.clone(),
                generation: st.generation,
                hangout: st.hangout,
                client_node: st.client_local,
                server_node: st.server_local,
                is_client_punching: st.is_client_punching,
                is_server_punching: st.is_server_punching,
                established: st.link_id.is_some(),
                created_unix_ms: st.created_unix_ms,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    /// Starts tracking every online peer that is neither us nor already tracked.
    ///
    /// For each new peer a client node and a server node are bound, and each
    /// asks `hangout` to pair it with the peer. The nodes then wait for the
    /// hangout's relay; a peer still unpaired after `punch.timeout` is
    /// forgotten. Returns how many peers were added. Socket errors are
    /// returned to the caller, which treats them as fatal.
    pub async fn on_status(
        self: &Arc<Self>,
        hangout: SocketAddr,
        online: impl IntoIterator<Item = PeerId>,
    ) -> io::Result<usize> {
        let ident = self.ctx.identity();
        let bind = self.ctx.config.node_bind_addr();
        let mut added = 0;

        // Held across the binds so a relay for a half-registered peer waits.
        let mut peers = self.peers.write().await;
        for peer in online {
            if self.ctx.is_self(&peer) || peers.contains_key(&peer) {
                continue;
            }

            let client = UdpSocket::bind(&bind).await?;
            let server = UdpSocket::bind(&bind).await?;
            send_request(
                &client,
                hangout,
                &HangoutRequest::PunchClient {
                    peer_id: peer.clone(),
                    ident_peer: ident.clone(),
                },
            )
            .await?;
            send_request(
                &server,
                hangout,
                &HangoutRequest::PunchServer {
                    peer_id: peer.clone(),
                    ident_peer: ident.clone(),
                },
            )
            .await?;

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (client_local, server_local) = (client.local_addr()?, server.local_addr()?);
            tracing::info!(
                peer = %peer,
                hangout = %hangout,
                generation,
                client_node = %client_local,
                server_node = %server_local,
                "punch: tracking peer"
            );

            let (client_tx, client_rx) = oneshot::channel();
            let (server_tx, server_rx) = oneshot::channel();
            let node_task = |role, node, relay| {
                tokio::spawn(Arc::clone(self).run_node(peer.clone(), generation, role, node, relay))
                    .abort_handle()
            };
            let tasks = vec![
                node_task(Role::Client, client, client_rx),
                node_task(Role::Server, server, server_rx),
                tokio::spawn(Arc::clone(self).expire_unpaired(peer.clone(), generation))
                    .abort_handle(),
            ];

            peers.insert(
                peer,
                PeerState {
                    generation,
                    hangout,
                    client_local,
                    server_local,
                    client_relay: Some(client_tx),
                    server_relay: Some(server_tx),
                    is_client_punching: false,
                    is_server_punching: false,
                    link_id: None,
                    created_unix_ms: telemetry::now_unix_ms(),
                    tasks,
                },
            );
            added += 1;
        }
        metrics::gauge!("punchgate_tracked_peers").set(peers.len() as f64);
        Ok(added)
    }

    /// Starts the `role` punch for a relay that arrived on the rendezvous socket,
    /// unless the peer is untracked or that role is already punching.
    pub async fn on_punch_relay(&self, role: Role, relay: &PunchRelay) -> RelayOutcome {
        let peer = &relay.ident_peer;
        let remote = relay.remote_addr();

        let mut peers = self.peers.write().await;
        let Some(st) = peers.get_mut(peer) else {
            return RelayOutcome::UnknownPeer;
        };
        let (punching, slot) = st.role_mut(role);
        if *punching {
            return RelayOutcome::AlreadyPunching;
        }
        let Some(tx) = slot.take() else {
            return RelayOutcome::AlreadyPunching;
        };
        *punching = true;

        tracing::info!(peer = %peer, role = %role, remote = %remote, "punch: starting");
        match tx.send(remote) {
            Ok(()) => RelayOutcome::Started,
            // The node task is gone; the peer is on its way out.
            Err(_) => RelayOutcome::UnknownPeer,
        }
    }

    /// Marks `role` as punching for a relay the node itself received.
    async fn claim(&self, peer: &PeerId, generation: u64, role: Role) -> bool {
        let mut peers = self.peers.write().await;
        let Some(st) = peers.get_mut(peer).filter(|st| st.generation == generation) else {
            return false;
        };
        let (punching, slot) = st.role_mut(role);
        if *punching {
            return false;
        }
        *punching = true;
        slot.take();
        true
    }

    /// Removes `peer` if its state is still `generation`. Returns whether it was removed.
    pub async fn forget(&self, peer: &PeerId, generation: u64, reason: &str) -> bool {
        self.forget_where(peer, reason, |st| st.generation == generation)
            .await
    }

    async fn forget_where(
        &self,
        peer: &PeerId,
        reason: &str,
        pred: impl FnOnce(&PeerState) -> bool,
    ) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            let removed = if peers.get(peer).is_some_and(pred) {
                peers.remove(peer)
            } else {
                None
            };
            metrics::gauge!("punchgate_tracked_peers").set(peers.len() as f64);
            removed
        };
        let Some(st) = removed else {
            return false;
        };

        if let Some(link_id) = st.link_id {
            self.mux.detach_link(peer, link_id);
        }
        tracing::info!(peer = %peer, generation = st.generation, reason, "punch: peer forgotten");
        // Aborts the peer's tasks, possibly including the caller.
        drop(st);
        true
    }

    /// Forgets the peer once `punch.timeout` has passed without an established
    /// link or a client punch still in flight, so the next STATUS starts over.
    async fn expire_unpaired(self: Arc<Self>, peer: PeerId, generation: u64) {
        tokio::time::sleep(self.ctx.config.punch.timeout).await;
        let expired = self
            .forget_where(&peer, "not paired before punch timeout", |st| {
                st.generation == generation && st.link_id.is_none() && !st.is_client_punching
            })
            .await;
        if expired {
            metrics::counter!("punchgate_unpaired_peers_expired_total").increment(1);
        }
    }

    /// Owns one node: waits for its relay, then runs the role on the same socket.
    async fn run_node(
        self: Arc<Self>,
        peer: PeerId,
        generation: u64,
        role: Role,
        node: UdpSocket,
        mut relay: oneshot::Receiver<String>,
    ) {
        let remote = match self.await_relay(&peer, generation, role, &node, &mut relay).await {
            Ok(Some(remote)) => remote,
            Ok(None) => return,
            Err(err) => return self.punch_failed(&peer, generation, role, err.into()).await,
        };
        match role {
            Role::Client => self.run_client_role(peer, generation, node, remote).await,
            Role::Server => self.run_server_role(peer, generation, node, remote).await,
        }
    }

    /// Reads hangout relays addressed to an idle node.
    ///
    /// Returns the remote address from whichever comes first: a relay on the
    /// node itself or one handed over from the rendezvous socket.
    async fn await_relay(
        &self,
        peer: &PeerId,
        generation: u64,
        role: Role,
        node: &UdpSocket,
        relay: &mut oneshot::Receiver<String>,
    ) -> io::Result<Option<String>> {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                res = &mut *relay => return Ok(res.ok()),
                res = node.recv_from(&mut buf) => {
                    let (n, from) = match res {
                        Ok(v) => v,
                        Err(err) if attempt::is_transient(&err) => continue,
                        Err(err) => return Err(err),
                    };
                    let Some(r) = relay_for(role, &buf[..n]) else {
                        tracing::debug!(peer = %peer, role = %role, from = %from, len = n, "punch: idle node ignoring datagram");
                        continue;
                    };
                    if r.ident_peer != *peer {
                        tracing::warn!(peer = %peer, role = %role, named = %r.ident_peer, "punch: relay names another peer; ignored");
                        continue;
                    }
                    if self.claim(peer, generation, role).await {
                        let remote = r.remote_addr();
                        tracing::info!(peer = %peer, role = %role, remote = %remote, hangout = %from, "punch: starting");
                        return Ok(Some(remote));
                    }
                }
            }
        }
    }

    async fn run_client_role(
        self: Arc<Self>,
        peer: PeerId,
        generation: u64,
        node: UdpSocket,
        remote: String,
    ) {
        let outcome = match self.punch_node(&node, &remote).await {
            Ok(o) => o,
            Err(err) => return self.punch_failed(&peer, generation, Role::Client, err).await,
        };
        log_open(&peer, Role::Client, &outcome);

        let stream = match KcpStream::connect_with_socket(&self.kcp, node, outcome.remote).await {
            Ok(s) => s,
            Err(err) => {
                let err = PunchError::Transport(err.to_string());
                return self.punch_failed(&peer, generation, Role::Client, err).await;
            }
        };

        // The link is live in the multiplexer before the peer counts as established.
        let link = self.mux.attach_client_link(peer.clone(), Box::new(stream));
        let current = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&peer) {
                Some(st) if st.generation == generation => {
                    st.link_id = Some(link.id);
                    true
                }
                _ => false,
            }
        };
        if !current {
            self.mux.detach_link(&peer, link.id);
            return;
        }

        metrics::counter!("punchgate_links_established_total").increment(1);
        tracing::info!(peer = %peer, link = link.id, "punch: peer established");

        link.closed().await;
        self.forget(&peer, generation, "link closed").await;
    }

    async fn run_server_role(
        self: Arc<Self>,
        peer: PeerId,
        generation: u64,
        node: UdpSocket,
        remote: String,
    ) {
        let outcome = match self.punch_node(&node, &remote).await {
            Ok(o) => o,
            Err(err) => return self.punch_failed(&peer, generation, Role::Server, err).await,
        };
        log_open(&peer, Role::Server, &outcome);

        let mut listener = match KcpListener::from_socket(self.kcp.clone(), node).await {
            Ok(l) => l,
            Err(err) => {
                let err = PunchError::Transport(err.to_string());
                return self.punch_failed(&peer, generation, Role::Server, err).await;
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    tracing::info!(peer = %peer, from = %from, "punch: server stream accepted");
                    let mux = self.mux.clone();
                    tokio::spawn(mux.serve_server_stream(peer.clone(), Box::new(stream)));
                }
                Err(err) => {
                    tracing::warn!(peer = %peer, err = %err, "punch: server node accept failed");
                    break;
                }
            }
        }
        self.forget(&peer, generation, "server node closed").await;
    }

    async fn punch_node(&self, node: &UdpSocket, remote: &str) -> Result<PunchOutcome, PunchError> {
        let target = net::resolve_socket_addr(remote)
            .await
            .map_err(|err| PunchError::Resolve {
                addr: remote.to_string(),
                reason: err.to_string(),
            })?;
        let cfg = &self.ctx.config.punch;
        let plan = PunchPlan {
            attempts: cfg.attempts,
            interval: cfg.interval,
        };
        tokio::time::timeout(cfg.timeout, attempt::punch(node, target, plan))
            .await
            .unwrap_or_else(|_| Err(PunchError::TimedOut(cfg.timeout)))
    }

    async fn punch_failed(&self, peer: &PeerId, generation: u64, role: Role, err: PunchError) {
        metrics::counter!("punchgate_punch_failures_total", "role" => role.as_str()).increment(1);
        if err.is_fatal() {
            tracing::error!(peer = %peer, role = %role, err = %err, "punch: node socket failed");
            let err = anyhow::Error::new(err).context(format!("{role} node for peer {peer}"));
            let _ = self.fatal.send(err);
        } else {
            tracing::warn!(peer = %peer, role = %role, err = %err, "punch: failed; peer will be retried on next status");
        }
        self.forget(peer, generation, "punch failed").await;
    }
}

fn log_open(peer: &PeerId, role: Role, outcome: &PunchOutcome) {
    metrics::counter!("punchgate_punch_success_total", "role" => role.as_str()).increment(1);
    tracing::info!(
        peer = %peer,
        role = %role,
        remote = %outcome.remote,
        attempts = outcome.attempts,
        "punch: hole open"
    );
}

/// The relay that starts `role`: a remote server node pairs with our client
/// node and vice versa.
fn relay_for(role: Role, buf: &[u8]) -> Option<PunchRelay> {
    match (role, protocol::decode(buf).ok()?) {
        (Role::Client, Inbound::Message(HangoutMessage::PunchServer(r))) => Some(r),
        (Role::Server, Inbound::Message(HangoutMessage::PunchClient(r))) => Some(r),
        _ => None,
    }
}

async fn send_request(node: &UdpSocket, hangout: SocketAddr, req: &HangoutRequest) -> io::Result<()> {
    let b = protocol::encode(req).map_err(io::Error::other)?;
    node.send_to(&b, hangout).await?;
    Ok(())
}
