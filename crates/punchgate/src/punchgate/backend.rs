//! Backend Listener: local TCP entry point for requests bound to remote peers.

use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::punchgate::{net, tunnel::mux::Multiplexer};

pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind backend listener {listen_addr}"))
}

/// Accepts connections until shutdown; each one becomes a tunnelled request.
pub async fn serve_with_shutdown(
    ln: TcpListener,
    mux: Arc<Multiplexer>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(listen_addr = %ln.local_addr()?, "backend: listening");

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, client) = res.context("backend: accept")?;
                let _ = conn.set_nodelay(true);
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %client, "backend: accepted");
                }
                tokio::spawn(mux.clone().handle_backend_conn(conn, client));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncReadExt, io::AsyncWriteExt, net::TcpStream};

    use super::*;
    use crate::punchgate::config::Config;

    #[tokio::test]
    async fn unroutable_connection_is_dropped_and_shutdown_stops_loop() {
        let mut cfg = Config::default();
        cfg.tunnel.max_prelude_bytes = 16;
        let mux = Multiplexer::new(&cfg).unwrap();
        let ln = bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve_with_shutdown(ln, mux, rx));

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"GET / HTTP/1.1\r\nHost: nobody.peer\r\n\r\n")
            .await
            .unwrap();
        let mut got = Vec::new();
        let res = tokio::time::timeout(Duration::from_secs(2), c.read_to_end(&mut got))
            .await
            .expect("connection closed");
        assert!(res.is_err() || got.is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop stops")
            .unwrap()
            .unwrap();
    }
}
