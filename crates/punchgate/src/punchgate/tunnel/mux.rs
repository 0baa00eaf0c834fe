use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{net::TcpStream, sync::oneshot};

use crate::punchgate::{
    config::Config,
    ids::{PeerId, RequestId},
    telemetry,
    tunnel::{
        client,
        frame::{FrameReader, TunnelFrame},
        link::{self, AttachedLink, BoxedStream, FrameSender},
        server::{self, ForwardOptions},
        sniff::VirtualHostSniffer,
    },
};

struct LinkEntry {
    id: u64,
    tx: FrameSender,
    since_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub peer: PeerId,
    pub link_id: u64,
    pub since_unix_ms: u64,
}

/// Owns the live client-role links and the requests waiting on them.
pub struct Multiplexer {
    links: DashMap<PeerId, LinkEntry>,
    pending: DashMap<RequestId, oneshot::Sender<Bytes>>,
    next_request: AtomicU64,
    next_link: AtomicU64,
    pub(crate) sniffer: VirtualHostSniffer,
    pub(crate) max_prelude_bytes: usize,
    forward: Arc<ForwardOptions>,
}

impl Multiplexer {
    pub fn new(cfg: &Config) -> Result<Arc<Self>, regex::Error> {
        Ok(Arc::new(Self {
            links: DashMap::new(),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            next_link: AtomicU64::new(1),
            sniffer: VirtualHostSniffer::new(&cfg.tunnel.domain_suffix)?,
            max_prelude_bytes: cfg.tunnel.max_prelude_bytes,
            forward: Arc::new(ForwardOptions {
                target: cfg.forward_target(),
                retry_delay: cfg.tunnel.backend_retry_delay,
            }),
        }))
    }

    /// Registers `stream` as the link to `peer`, replacing any previous one.
    ///
    /// The stream's inbound frames are matched to pending requests by id.
    pub fn attach_client_link(self: &Arc<Self>, peer: PeerId, stream: BoxedStream) -> AttachedLink {
        let (rd, wr) = tokio::io::split(stream);
        let (tx, mut writer) = link::spawn_writer(wr);
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);

        let replaced = self.links.insert(
            peer.clone(),
            LinkEntry {
                id,
                tx,
                since_unix_ms: telemetry::now_unix_ms(),
            },
        );
        if let Some(old) = replaced {
            tracing::info!(peer = %peer, old_link = old.id, link = id, "tunnel: link replaced");
        } else {
            tracing::info!(peer = %peer, link = id, "tunnel: link up");
        }
        metrics::gauge!("punchgate_links").set(self.links.len() as f64);

        let (closed_tx, closed_rx) = oneshot::channel();
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(rd);
            let read = async {
                loop {
                    match reader.next_frame().await {
                        Ok(Some(f)) => mux.deliver_response(f),
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(peer = %peer, err = %err, "tunnel: link read failed");
                            break;
                        }
                    }
                }
            };
            tokio::select! {
                _ = read => {}
                _ = &mut writer => {}
            }
            writer.abort();
            mux.detach_link(&peer, id);
            let _ = closed_tx.send(());
        });

        AttachedLink::new(id, closed_rx)
    }

    /// Drops the link to `peer` if it is still the one with `link_id`.
    pub fn detach_link(&self, peer: &PeerId, link_id: u64) -> bool {
        let removed = self.links.remove_if(peer, |_, e| e.id == link_id).is_some();
        if removed {
            metrics::gauge!("punchgate_links").set(self.links.len() as f64);
            tracing::info!(peer = %peer, link = link_id, "tunnel: link down");
        }
        removed
    }

    pub fn has_link(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    pub(crate) fn link_sender(&self, peer: &PeerId) -> Option<FrameSender> {
        self.links.get(peer).map(|e| e.tx.clone())
    }

    pub fn snapshot_links(&self) -> Vec<LinkSnapshot> {
        let mut out = self
            .links
            .iter()
            .map(|e| LinkSnapshot {
                peer: e.key().clone(),
                link_id: e.id,
                since_unix_ms: e.since_unix_ms,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn begin_request(&self) -> (RequestId, oneshot::Receiver<Bytes>) {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    pub(crate) fn end_request(&self, id: RequestId) {
        self.pending.remove(&id);
    }

    fn deliver_response(&self, f: TunnelFrame) {
        metrics::counter!("punchgate_frames_received_total").increment(1);
        match self.pending.remove(&f.id) {
            Some((_, tx)) => {
                let _ = tx.send(f.data);
            }
            None => tracing::debug!(request = %f.id, "tunnel: response for finished request"),
        }
    }

    /// Server role: forwards every request arriving on `stream` to the local target.
    pub async fn serve_server_stream(self: Arc<Self>, peer: PeerId, stream: BoxedStream) {
        if let Err(err) = server::serve_stream(peer.clone(), stream, self.forward.clone()).await {
            tracing::debug!(peer = %peer, err = %err, "tunnel: server stream ended with error");
        }
    }

    /// Client role: relays one Backend Listener connection to the peer it names.
    pub async fn handle_backend_conn(self: Arc<Self>, conn: TcpStream, from: SocketAddr) {
        if let Err(err) = client::relay(&self, conn).await {
            tracing::debug!(client = %from, err = %err, "tunnel: backend connection dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn link_table_tracks_attach_and_close() {
        let mux = Multiplexer::new(&Config::default()).unwrap();
        let (near, far) = tokio::io::duplex(1024);

        let link = mux.attach_client_link(PeerId::from("bob"), Box::new(far));
        assert!(mux.has_link("bob"));
        assert_eq!(mux.snapshot_links()[0].link_id, link.id);

        drop(near);
        tokio::time::timeout(Duration::from_secs(2), link.closed())
            .await
            .expect("link closes with its stream");
        assert!(!mux.has_link("bob"));
    }

    #[tokio::test]
    async fn stale_detach_keeps_replacement() {
        let mux = Multiplexer::new(&Config::default()).unwrap();
        let (_near1, far1) = tokio::io::duplex(1024);
        let (_near2, far2) = tokio::io::duplex(1024);

        let first = mux.attach_client_link(PeerId::from("bob"), Box::new(far1));
        let second = mux.attach_client_link(PeerId::from("bob"), Box::new(far2));

        assert!(!mux.detach_link(&PeerId::from("bob"), first.id));
        assert!(mux.has_link("bob"));
        assert!(mux.detach_link(&PeerId::from("bob"), second.id));
        assert!(!mux.has_link("bob"));
    }

    #[tokio::test]
    async fn responses_resolve_pending_requests_once() {
        let mux = Multiplexer::new(&Config::default()).unwrap();
        let (mut near, far) = tokio::io::duplex(1024);
        let _link = mux.attach_client_link(PeerId::from("bob"), Box::new(far));

        let (id, rx) = mux.begin_request();
        assert_eq!(mux.pending_requests(), 1);

        let reply = crate::punchgate::tunnel::frame::encode(&TunnelFrame {
            id,
            data: Bytes::from_static(b"HTTP/1.1 204 No Content\r\n\r\n"),
        })
        .unwrap();
        near.write_all(&reply).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(mux.pending_requests(), 0);
    }
}
