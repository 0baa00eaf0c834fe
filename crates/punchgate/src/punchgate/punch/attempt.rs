use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{net::UdpSocket, time::Instant};

use crate::punchgate::punch::datagram::{PunchDatagram, PunchKind};

#[derive(Debug, Error)]
pub enum PunchError {
    #[error("punch: no answer after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("punch: timed out after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
    #[error("punch: resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },
    #[error("punch: transport: {0}")]
    Transport(String),
    #[error("punch: socket: {0}")]
    Io(#[from] io::Error),
}

impl PunchError {
    /// Socket failures take the process down; everything else only drops the peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PunchError::Io(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PunchOutcome {
    /// Where the remote's datagrams actually came from.
    pub remote: SocketAddr,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PunchPlan {
    pub attempts: u32,
    pub interval: Duration,
}

/// Extra acks sent when we learn of the path from the remote's punch.
const ACK_COPIES: usize = 3;

/// Sends punch datagrams from `socket` toward `target` until the remote answers.
///
/// Completes on the first punch or ack received. A received punch is acked
/// before returning so the remote completes too.
pub async fn punch(
    socket: &UdpSocket,
    target: SocketAddr,
    plan: PunchPlan,
) -> Result<PunchOutcome, PunchError> {
    let local = socket.local_addr()?;
    let hello = PunchDatagram::punch(local).encode();
    let ack = PunchDatagram::ack(local).encode();
    let mut buf = [0u8; 64];

    for attempt in 1..=plan.attempts {
        match socket.send_to(&hello, target).await {
            Ok(_) => {}
            // Some platforms surface an ICMP unreachable from an earlier send here.
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }
        metrics::counter!("punchgate_punch_datagrams_sent_total").increment(1);

        let deadline = Instant::now() + plan.interval;
        loop {
            let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (n, from) = match recv {
                Err(_) => break,
                Ok(Ok(v)) => v,
                Ok(Err(err)) if is_transient(&err) => continue,
                Ok(Err(err)) => return Err(err.into()),
            };

            match PunchDatagram::decode(&buf[..n]) {
                Ok(d) => {
                    tracing::debug!(from = %from, remote_local = %d.local, kind = ?d.kind, "punch: answered");
                    if d.kind == PunchKind::Punch {
                        for _ in 0..ACK_COPIES {
                            socket.send_to(&ack, from).await?;
                        }
                    }
                    return Ok(PunchOutcome {
                        remote: from,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    tracing::debug!(from = %from, err = %err, "punch: ignoring datagram");
                }
            }
        }
    }

    Err(PunchError::Exhausted {
        attempts: plan.attempts,
    })
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
