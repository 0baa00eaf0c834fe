use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::punchgate::ids::RequestId;

/// Upper bound on bytes buffered while waiting for one frame to complete.
pub const MAX_BUFFERED_FRAME_BYTES: usize = 64 << 20; // 64 MiB

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("frame {id}: bad base64 payload: {source}")]
    BadPayload {
        id: RequestId,
        #[source]
        source: base64::DecodeError,
    },
    #[error("frame exceeds {0} buffered bytes")]
    TooLarge(usize),
    #[error("json: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One slice of a proxied TCP stream, tagged with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub id: RequestId,
    pub data: Bytes,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    id: RequestId,
    data: String,
}

pub fn encode(frame: &TunnelFrame) -> Result<Vec<u8>, FrameError> {
    let wire = WireFrame {
        id: frame.id,
        data: STANDARD.encode(&frame.data),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Accumulates link bytes and yields complete frames from the front of the buffer.
///
/// Bytes are only consumed once a whole frame parses; a partial frame stays
/// buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<TunnelFrame>, FrameError> {
        let (next, used) = {
            let mut it = serde_json::Deserializer::from_slice(&self.buf).into_iter::<WireFrame>();
            let next = it.next();
            (next, it.byte_offset())
        };

        match next {
            None => {
                // Only whitespace left.
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(wire)) => {
                self.buf.advance(used);
                let data = STANDARD
                    .decode(wire.data.as_bytes())
                    .map_err(|source| FrameError::BadPayload {
                        id: wire.id,
                        source,
                    })?;
                Ok(Some(TunnelFrame {
                    id: wire.id,
                    data: Bytes::from(data),
                }))
            }
            Some(Err(err)) if err.is_eof() => {
                if self.buf.len() > MAX_BUFFERED_FRAME_BYTES {
                    self.buf.clear();
                    return Err(FrameError::TooLarge(MAX_BUFFERED_FRAME_BYTES));
                }
                Ok(None)
            }
            Some(Err(err)) => {
                self.buf.clear();
                Err(FrameError::Malformed(err))
            }
        }
    }
}

/// Reads frames off one direction of a link.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 16 * 1024],
        }
    }

    /// Next well-formed frame, or `None` once the link reaches EOF.
    ///
    /// Malformed input is logged and dropped; the link stays usable.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<TunnelFrame>> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(f)) => return Ok(Some(f)),
                Ok(None) => {}
                Err(err) => {
                    metrics::counter!("punchgate_malformed_frames_total").increment(1);
                    tracing::warn!(err = %err, "tunnel: dropping malformed frame");
                    continue;
                }
            }

            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        buffered = self.decoder.buffered(),
                        "tunnel: link closed mid-frame"
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn frame(id: u64, data: &[u8]) -> TunnelFrame {
        TunnelFrame {
            id: RequestId(id),
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn wire_shape_is_id_and_base64_data() {
        let b = encode(&frame(7, b"hello")).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v, serde_json::json!({"id": 7, "data": "aGVsbG8="}));
    }

    #[test]
    fn roundtrip_empty_and_datagram_sized_binary() {
        let big: Vec<u8> = (0..65_507u32).map(|i| (i * 31 % 256) as u8).collect();
        for payload in [Vec::new(), vec![0u8, 255, 10, 13], big] {
            let mut d = FrameDecoder::new();
            d.push(&encode(&frame(1, &payload)).unwrap());
            let got = d.next_frame().unwrap().unwrap();
            assert_eq!(got.data.as_ref(), payload.as_slice());
            assert_eq!(d.buffered(), 0);
        }
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let b = encode(&frame(3, b"split across reads")).unwrap();
        let (head, tail) = b.split_at(b.len() / 2);

        let mut d = FrameDecoder::new();
        d.push(head);
        assert!(d.next_frame().unwrap().is_none());
        assert_eq!(d.buffered(), head.len());

        d.push(tail);
        assert_eq!(d.next_frame().unwrap().unwrap(), frame(3, b"split across reads"));
    }

    #[test]
    fn back_to_back_frames_are_separated() {
        let mut d = FrameDecoder::new();
        d.push(&encode(&frame(1, b"a")).unwrap());
        d.push(&encode(&frame(2, b"b")).unwrap());
        d.push(b"{\"id\":3");

        assert_eq!(d.next_frame().unwrap().unwrap(), frame(1, b"a"));
        assert_eq!(d.next_frame().unwrap().unwrap(), frame(2, b"b"));
        assert!(d.next_frame().unwrap().is_none());
        assert_eq!(d.buffered(), b"{\"id\":3".len());
    }

    #[test]
    fn malformed_input_is_dropped() {
        let mut d = FrameDecoder::new();
        d.push(b"]garbage");
        assert!(matches!(d.next_frame(), Err(FrameError::Malformed(_))));
        assert_eq!(d.buffered(), 0);

        d.push(br#"{"id":4,"data":"!!!"}"#);
        match d.next_frame() {
            Err(FrameError::BadPayload { id, .. }) => assert_eq!(id, RequestId(4)),
            other => panic!("unexpected: {other:?}"),
        }

        d.push(&encode(&frame(5, b"ok")).unwrap());
        assert_eq!(d.next_frame().unwrap().unwrap(), frame(5, b"ok"));
    }

    #[tokio::test]
    async fn reader_skips_garbage_and_stops_at_eof() {
        let (mut a, b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            a.write_all(&encode(&frame(1, b"x")).unwrap()).await.unwrap();
            a.write_all(b"}").await.unwrap();
            a.write_all(&encode(&frame(2, b"y")).unwrap()).await.unwrap();
        });

        let mut r = FrameReader::new(b);
        assert_eq!(r.next_frame().await.unwrap().unwrap(), frame(1, b"x"));
        let second = r.next_frame().await.unwrap();
        // The stray brace may arrive in the same read as frame 2 and take it
        // down with it; either way the reader must not error out.
        if let Some(f) = second {
            assert_eq!(f, frame(2, b"y"));
        }
        assert!(r.next_frame().await.unwrap().is_none());
    }
}
