//! Server role of a link: frames in, backend connections out.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::punchgate::{
    ids::{PeerId, RequestId},
    telemetry::ActiveRequestGuard,
    tunnel::{
        frame::{FrameReader, TunnelFrame},
        link::{self, BoxedStream, FrameSender},
    },
};

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Local service that receives tunnelled requests.
    pub target: String,
    pub retry_delay: Duration,
}

/// Serves one accepted stream until it reaches EOF.
///
/// Every new request id gets its own backend connection; later frames with
/// the same id are appended to it.
pub async fn serve_stream(
    peer: PeerId,
    stream: BoxedStream,
    opts: Arc<ForwardOptions>,
) -> io::Result<()> {
    let (rd, wr) = tokio::io::split(stream);
    let (reply, _writer) = link::spawn_writer(wr);
    let mut reader = FrameReader::new(rd);
    let mut open: HashMap<RequestId, mpsc::UnboundedSender<Bytes>> = HashMap::new();

    tracing::info!(peer = %peer, "tunnel: server stream opened");

    while let Some(f) = reader.next_frame().await? {
        metrics::counter!("punchgate_frames_received_total").increment(1);
        open.retain(|_, tx| !tx.is_closed());

        let TunnelFrame { id, data } = f;
        let data = match open.get(&id) {
            Some(tx) => match tx.send(data) {
                Ok(()) => continue,
                // Forwarder finished between the prune and the send; treat as new.
                Err(mpsc::error::SendError(data)) => data,
            },
            None => data,
        };
        open.insert(id, spawn_forward(id, data, &opts, reply.clone()));
    }

    tracing::info!(peer = %peer, in_flight = open.len(), "tunnel: server stream closed");
    Ok(())
}

fn spawn_forward(
    id: RequestId,
    first: Bytes,
    opts: &Arc<ForwardOptions>,
    reply: FrameSender,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    let opts = opts.clone();
    tokio::spawn(async move {
        forward_request(id, first, rx, &opts, reply).await;
    });
    tx
}

async fn forward_request(
    id: RequestId,
    first: Bytes,
    mut more: mpsc::UnboundedReceiver<Bytes>,
    opts: &ForwardOptions,
    reply: FrameSender,
) {
    let _active = ActiveRequestGuard::new();
    let mut conn = connect_with_retry(id, opts).await;

    if let Err(err) = conn.write_all(&first).await {
        tracing::warn!(request = %id, err = %err, "tunnel: backend write failed");
        return;
    }

    let mut response = BytesMut::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut more_open = true;
    loop {
        tokio::select! {
            chunk = more.recv(), if more_open => match chunk {
                Some(b) => {
                    if let Err(err) = conn.write_all(&b).await {
                        tracing::warn!(request = %id, err = %err, "tunnel: backend write failed");
                        break;
                    }
                }
                None => more_open = false,
            },
            n = conn.read(&mut buf) => match n {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(err) => {
                    tracing::warn!(request = %id, err = %err, "tunnel: backend read failed");
                    break;
                }
            },
        }
    }
    drop(conn);

    tracing::debug!(request = %id, bytes = response.len(), "tunnel: backend response complete");
    let f = TunnelFrame {
        id,
        data: response.freeze(),
    };
    if reply.send(f).await.is_err() {
        tracing::debug!(request = %id, "tunnel: link gone before reply");
    }
}

/// Dials the forward target until it accepts. There is no attempt cap.
async fn connect_with_retry(id: RequestId, opts: &ForwardOptions) -> TcpStream {
    loop {
        match TcpStream::connect(&opts.target).await {
            Ok(c) => {
                let _ = c.set_nodelay(true);
                return c;
            }
            Err(err) => {
                metrics::counter!("punchgate_backend_retries_total").increment(1);
                tracing::warn!(
                    request = %id,
                    target = %opts.target,
                    err = %err,
                    retry_in = %humantime::format_duration(opts.retry_delay),
                    "tunnel: backend connect failed; retrying"
                );
                tokio::time::sleep(opts.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::DuplexStream, net::TcpListener};

    use super::*;
    use crate::punchgate::tunnel::link::spawn_writer;

    fn opts(target: String) -> Arc<ForwardOptions> {
        Arc::new(ForwardOptions {
            target,
            retry_delay: Duration::from_millis(100),
        })
    }

    fn start(target: String) -> (FrameSender, FrameReader<tokio::io::ReadHalf<DuplexStream>>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_stream(PeerId::from("alice"), Box::new(far), opts(target)));
        let (rd, wr) = tokio::io::split(near);
        let (tx, _task) = spawn_writer(wr);
        (tx, FrameReader::new(rd))
    }

    /// Reads until `want` bytes arrived, answers with `reply`, closes.
    async fn echo_once(ln: TcpListener, want: usize, reply: &'static [u8]) -> Vec<u8> {
        let (mut c, _) = ln.accept().await.unwrap();
        let mut got = vec![0u8; want];
        c.read_exact(&mut got).await.unwrap();
        c.write_all(reply).await.unwrap();
        c.shutdown().await.unwrap();
        got
    }

    #[tokio::test]
    async fn forwards_payload_and_replies_with_same_id() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ln.local_addr().unwrap().to_string();
        let backend = tokio::spawn(echo_once(ln, 5, b"world"));

        let (tx, mut rx) = start(target);
        tx.send(TunnelFrame {
            id: RequestId(7),
            data: Bytes::from_static(b"hello"),
        })
        .await
        .unwrap();

        assert_eq!(backend.await.unwrap(), b"hello");
        let f = rx.next_frame().await.unwrap().unwrap();
        assert_eq!(f.id, RequestId(7));
        assert_eq!(f.data.as_ref(), b"world");
    }

    #[tokio::test]
    async fn later_frames_reuse_the_backend_connection() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ln.local_addr().unwrap().to_string();
        let backend = tokio::spawn(echo_once(ln, 10, b"done"));

        let (tx, mut rx) = start(target);
        for chunk in [&b"first"[..], &b"-more"[..]] {
            tx.send(TunnelFrame {
                id: RequestId(3),
                data: Bytes::copy_from_slice(chunk),
            })
            .await
            .unwrap();
        }

        assert_eq!(backend.await.unwrap(), b"first-more");
        let f = rx.next_frame().await.unwrap().unwrap();
        assert_eq!((f.id, f.data.as_ref()), (RequestId(3), &b"done"[..]));
    }

    #[tokio::test]
    async fn retries_until_backend_comes_up() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (tx, mut rx) = start(addr.to_string());
        tx.send(TunnelFrame {
            id: RequestId(1),
            data: Bytes::from_static(b"ping"),
        })
        .await
        .unwrap();

        // Let a few connects fail first.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let ln = TcpListener::bind(addr).await.unwrap();
        let backend = tokio::spawn(echo_once(ln, 4, b"pong"));

        assert_eq!(backend.await.unwrap(), b"ping");
        let f = tokio::time::timeout(Duration::from_secs(5), rx.next_frame())
            .await
            .expect("reply after retry")
            .unwrap()
            .unwrap();
        assert_eq!((f.id, f.data.as_ref()), (RequestId(1), &b"pong"[..]));
    }
}
