use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::punchgate::tunnel::frame::{self, TunnelFrame};

/// A bidirectional async byte stream.
///
/// Trait objects can only have one non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is folded into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Frames queued per link before senders wait.
pub const LINK_QUEUE: usize = 256;

pub type FrameSender = mpsc::Sender<TunnelFrame>;

/// Serializes queued frames onto the link, one at a time, in queue order.
///
/// The task ends when every sender is dropped or a write fails.
pub fn spawn_writer<W>(writer: W) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINK_QUEUE);
    let task = tokio::spawn(async move {
        if let Err(err) = write_frames(writer, rx).await {
            tracing::debug!(err = %err, "tunnel: link writer stopped");
        }
    });
    (tx, task)
}

async fn write_frames<W>(mut w: W, mut rx: mpsc::Receiver<TunnelFrame>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(f) = rx.recv().await {
        let b = frame::encode(&f)?;
        w.write_all(&b).await?;
        w.flush().await?;
        metrics::counter!("punchgate_frames_sent_total").increment(1);
        metrics::counter!("punchgate_frame_bytes_sent_total").increment(f.data.len() as u64);
    }
    let _ = w.shutdown().await;
    Ok(())
}

/// Handle returned when a client-role stream joins the multiplexer.
#[derive(Debug)]
pub struct AttachedLink {
    pub id: u64,
    closed: oneshot::Receiver<()>,
}

impl AttachedLink {
    pub(crate) fn new(id: u64, closed: oneshot::Receiver<()>) -> Self {
        Self { id, closed }
    }

    /// Resolves once the link's stream has ended and it left the link table.
    pub async fn closed(self) {
        let _ = self.closed.await;
    }
}
