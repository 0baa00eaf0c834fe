//! Client role of a link: one Backend Listener connection becomes one request.

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::punchgate::{
    ids::{PeerId, RequestId},
    telemetry::ActiveRequestGuard,
    tunnel::{frame::TunnelFrame, mux::Multiplexer},
};

/// Bytes read from a backend connection that have not been framed yet.
///
/// Until a peer is resolved the whole prelude accumulates here; afterwards
/// each read is sent as soon as it arrives.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    buffer: BytesMut,
    peer: Option<PeerId>,
}

impl PendingRequest {
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            buffer: BytesMut::new(),
            peer: None,
        }
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }
}

pub(crate) async fn relay(mux: &Multiplexer, mut conn: TcpStream) -> anyhow::Result<()> {
    let _active = ActiveRequestGuard::new();
    let (id, response) = mux.begin_request();
    let res = pump(mux, &mut conn, id, response).await;
    mux.end_request(id);
    res
}

async fn pump(
    mux: &Multiplexer,
    conn: &mut TcpStream,
    id: RequestId,
    mut response: tokio::sync::oneshot::Receiver<bytes::Bytes>,
) -> anyhow::Result<()> {
    let (mut rd, mut wr) = conn.split();
    let mut req = PendingRequest::new(id);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            data = &mut response => {
                if let Ok(data) = data {
                    tracing::debug!(request = %id, bytes = data.len(), "tunnel: response received");
                    wr.write_all(&data).await?;
                }
                let _ = wr.shutdown().await;
                return Ok(());
            }
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    // Half-close from the backend client ends the request.
                    flush(mux, &mut req).await?;
                    if req.peer.is_none() && !req.buffer.is_empty() {
                        tracing::debug!(
                            request = %id,
                            buffered = req.buffer.len(),
                            "tunnel: connection closed before a peer was named"
                        );
                    }
                    return Ok(());
                }
                on_chunk(mux, &mut req, &buf[..n]).await?;
            }
        }
    }
}

async fn on_chunk(mux: &Multiplexer, req: &mut PendingRequest, chunk: &[u8]) -> anyhow::Result<()> {
    req.buffer.extend_from_slice(chunk);

    if req.peer.is_none() {
        match mux.sniffer.find_peer(&req.buffer, |p| mux.has_link(p)) {
            Some(peer) => {
                tracing::debug!(request = %req.id, peer = %peer, "tunnel: request routed");
                req.peer = Some(peer);
            }
            None if req.buffer.len() > mux.max_prelude_bytes => {
                metrics::counter!("punchgate_unrouted_requests_total").increment(1);
                anyhow::bail!(
                    "no live peer named in the first {} bytes",
                    mux.max_prelude_bytes
                );
            }
            None => return Ok(()),
        }
    }

    flush(mux, req).await
}

/// Sends everything buffered for a routed request as a single frame.
async fn flush(mux: &Multiplexer, req: &mut PendingRequest) -> anyhow::Result<()> {
    let Some(peer) = &req.peer else {
        return Ok(());
    };
    if req.buffer.is_empty() {
        return Ok(());
    }
    let tx = mux
        .link_sender(peer)
        .ok_or_else(|| anyhow::anyhow!("link to {peer} is gone"))?;
    let f = TunnelFrame {
        id: req.id,
        data: req.buffer.split().freeze(),
    };
    tx.send(f)
        .await
        .map_err(|_| anyhow::anyhow!("link to {peer} closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{io::DuplexStream, net::TcpListener};

    use super::*;
    use crate::punchgate::{
        config::Config,
        tunnel::frame::{self, FrameReader},
    };

    /// Multiplexer with one link to `alice` and a local listener feeding it.
    async fn harness() -> (
        Arc<Multiplexer>,
        FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
        SocketAddr,
    ) {
        let mut cfg = Config::default();
        cfg.tunnel.max_prelude_bytes = 256;
        let mux = Multiplexer::new(&cfg).unwrap();

        let (near, far) = tokio::io::duplex(64 * 1024);
        let _link = mux.attach_client_link(PeerId::from("alice"), Box::new(far));
        let (rd, wr) = tokio::io::split(near);

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let m = mux.clone();
        tokio::spawn(async move {
            while let Ok((c, from)) = ln.accept().await {
                tokio::spawn(m.clone().handle_backend_conn(c, from));
            }
        });
        (mux, FrameReader::new(rd), wr, addr)
    }

    async fn next(r: &mut FrameReader<tokio::io::ReadHalf<DuplexStream>>) -> TunnelFrame {
        tokio::time::timeout(Duration::from_secs(2), r.next_frame())
            .await
            .expect("frame in time")
            .unwrap()
            .expect("link open")
    }

    #[tokio::test]
    async fn prelude_then_stream_in_order_and_reply() {
        let (_mux, mut link, mut link_wr, addr) = harness().await;
        let mut c = TcpStream::connect(addr).await.unwrap();

        c.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.write_all(b"Host: alice.peer\r\n\r\n").await.unwrap();

        let first = next(&mut link).await;
        assert_eq!(
            first.data.as_ref(),
            b"GET / HTTP/1.1\r\nHost: alice.peer\r\n\r\n"
        );

        for chunk in [&b"body-1"[..], &b"body-2"[..]] {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.write_all(chunk).await.unwrap();
            let f = next(&mut link).await;
            assert_eq!(f.id, first.id);
            assert_eq!(f.data.as_ref(), chunk);
        }

        let reply = frame::encode(&TunnelFrame {
            id: first.id,
            data: bytes::Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nhi"),
        })
        .unwrap();
        link_wr.write_all(&reply).await.unwrap();

        let mut got = Vec::new();
        c.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"HTTP/1.1 200 OK\r\n\r\nhi");
    }

    #[tokio::test]
    async fn requests_get_distinct_ids() {
        let (_mux, mut link, _link_wr, addr) = harness().await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"Host: alice.peer\r\n").await.unwrap();
        let fa = next(&mut link).await;

        let mut b = TcpStream::connect(addr).await.unwrap();
        b.write_all(b"Host: alice.peer\r\n").await.unwrap();
        let fb = next(&mut link).await;

        assert_ne!(fa.id, fb.id);
    }

    #[tokio::test]
    async fn unknown_peer_over_prelude_limit_is_dropped() {
        let (mux, _link, _link_wr, addr) = harness().await;
        let mut c = TcpStream::connect(addr).await.unwrap();

        c.write_all(b"Host: nobody.peer\r\n").await.unwrap();
        c.write_all(&[b'x'; 300]).await.unwrap();

        let mut got = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), c.read_to_end(&mut got))
            .await
            .expect("connection dropped")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(mux.pending_requests(), 0);
    }

    #[test]
    fn pending_request_starts_unrouted() {
        let r = PendingRequest::new(RequestId(9));
        assert_eq!(r.id, RequestId(9));
        assert!(r.peer().is_none());
    }
}
