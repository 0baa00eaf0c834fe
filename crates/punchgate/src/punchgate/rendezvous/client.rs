use std::{io, net::SocketAddr, sync::Arc};

use anyhow::Context;
use rand::seq::SliceRandom;
use tokio::{net::UdpSocket, sync::watch, time::MissedTickBehavior};

use crate::punchgate::{
    bootstrap::{BootstrapLoader, HangoutAddr},
    context::ProxyContext,
    net,
    punch::puncher::{HolePuncher, RelayOutcome, Role},
    rendezvous::protocol::{self, HangoutMessage, HangoutRequest, Inbound, PONG, PunchRelay},
};

/// The single UDP socket this node uses to talk to hangouts.
pub struct RendezvousClient {
    ctx: Arc<ProxyContext>,
    socket: UdpSocket,
    puncher: Arc<HolePuncher>,
    /// Reloads the directory on every refresh after the first.
    loader: Option<Arc<BootstrapLoader>>,
}

impl RendezvousClient {
    pub async fn bind(ctx: Arc<ProxyContext>, puncher: Arc<HolePuncher>) -> anyhow::Result<Self> {
        let addr = ctx.config.rendezvous_bind_addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("rendezvous: bind {addr}"))?;
        tracing::info!(addr = %socket.local_addr()?, "rendezvous: socket bound");
        Ok(Self::from_socket(ctx, socket, puncher))
    }

    pub fn from_socket(ctx: Arc<ProxyContext>, socket: UdpSocket, puncher: Arc<HolePuncher>) -> Self {
        Self {
            ctx,
            socket,
            puncher,
            loader: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<BootstrapLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers on every refresh tick and handles hangout datagrams until shutdown.
    ///
    /// Any socket error ends the loop with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut refresh = tokio::time::interval(self.ctx.config.refresh_peer_list);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 64 * 1024];
        // The startup load is fresh; reload from the second tick on.
        let mut reload = false;

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = refresh.tick() => {
                    if std::mem::replace(&mut reload, true) {
                        self.refresh_directory().await;
                    }
                    let sent = self.register_once().await?;
                    tracing::debug!(sent, "rendezvous: register round done");
                }
                res = self.socket.recv_from(&mut buf) => {
                    let (n, from) = res.context("rendezvous: receive")?;
                    self.on_datagram(&buf[..n], from).await?;
                }
            }
        }
    }

    /// Fetches a fresh directory from a reshuffled URL list and installs it.
    ///
    /// A failed reload keeps the current directory. Returns whether a new one
    /// was installed.
    pub async fn refresh_directory(&self) -> bool {
        let Some(loader) = &self.loader else {
            return false;
        };
        match loader.load(true).await {
            Ok(dir) => {
                self.ctx.install_directory(dir);
                true
            }
            Err(err) => {
                tracing::warn!(err = %err, "rendezvous: directory reload failed; keeping current directory");
                false
            }
        }
    }

    /// Sends REGISTER for every untracked peer to every hangout, hangouts in random order.
    pub async fn register_once(&self) -> anyhow::Result<usize> {
        let dir = self.ctx.directory();
        let tracked = self.puncher.tracked_peers().await;

        let mut hangouts: Vec<&HangoutAddr> = dir.hangouts.values().collect();
        hangouts.shuffle(&mut rand::rng());

        let mut sent = 0;
        for h in hangouts {
            let dial = h.dial_addr();
            let addr = match net::resolve_socket_addr(&dial).await {
                Ok(a) => a,
                Err(err) => {
                    tracing::warn!(hangout = %dial, err = %err, "rendezvous: hangout unresolvable; skipping");
                    continue;
                }
            };

            for peer in dir.peers.keys() {
                if self.ctx.is_self(peer) || tracked.contains(peer) {
                    continue;
                }
                let b = protocol::encode(&HangoutRequest::Register {
                    peer_id: peer.clone(),
                })?;
                self.socket
                    .send_to(&b, addr)
                    .await
                    .with_context(|| format!("rendezvous: send REGISTER to {addr}"))?;
                sent += 1;
            }
        }
        metrics::counter!("punchgate_registers_sent_total").increment(sent as u64);
        Ok(sent)
    }

    /// Handles one hangout datagram. Only socket errors are returned.
    pub async fn on_datagram(&self, buf: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        match protocol::decode(buf) {
            Ok(Inbound::Ping) => {
                self.socket
                    .send_to(PONG, from)
                    .await
                    .with_context(|| format!("rendezvous: pong to {from}"))?;
            }
            Ok(Inbound::Message(m)) => self.on_message(m, from).await?,
            Err(err) => {
                metrics::counter!("punchgate_malformed_hangout_messages_total").increment(1);
                tracing::warn!(from = %from, len = buf.len(), err = %err, "rendezvous: dropping malformed datagram");
            }
        }
        Ok(())
    }

    async fn on_message(&self, m: HangoutMessage, from: SocketAddr) -> anyhow::Result<()> {
        match m {
            HangoutMessage::Identity { peer_id } => {
                if !self.ctx.is_self(&peer_id) {
                    tracing::info!(hangout = %from, peer_id = %peer_id, "rendezvous: identity assigned");
                }
                self.ctx.set_identity(peer_id);
            }
            HangoutMessage::Status { online } => {
                let added = self
                    .puncher
                    .on_status(from, online.into_keys())
                    .await
                    .context("rendezvous: start tracking peers")?;
                if added > 0 {
                    tracing::info!(hangout = %from, added, "rendezvous: status");
                }
            }
            HangoutMessage::PunchClient(relay) => self.relay(Role::Server, &relay, from).await,
            HangoutMessage::PunchServer(relay) => self.relay(Role::Client, &relay, from).await,
            HangoutMessage::Unknown => {
                tracing::debug!(hangout = %from, "rendezvous: ignoring unknown message type");
            }
        }
        Ok(())
    }

    async fn relay(&self, role: Role, relay: &PunchRelay, from: SocketAddr) {
        match self.puncher.on_punch_relay(role, relay).await {
            RelayOutcome::Started => {}
            RelayOutcome::AlreadyPunching => {
                tracing::debug!(peer = %relay.ident_peer, role = %role, "rendezvous: punch already running");
            }
            RelayOutcome::UnknownPeer => {
                tracing::warn!(
                    hangout = %from,
                    peer = %relay.ident_peer,
                    role = %role,
                    "rendezvous: relay for untracked peer dropped"
                );
            }
        }
    }
}
