use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::mpsc, task::JoinSet};

use crate::punchgate::{
    admin, backend,
    bootstrap::BootstrapLoader,
    config,
    context::ProxyContext,
    logging, net,
    punch::puncher::HolePuncher,
    rendezvous::client::RendezvousClient,
    telemetry,
    tunnel::mux::Multiplexer,
};

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend_bind_ip: Option<String>,
    pub backend_port: Option<u16>,
}

impl Overrides {
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(ip) = &self.backend_bind_ip {
            cfg.backend_bind_ip = ip.trim().to_string();
        }
        if let Some(port) = self.backend_port {
            cfg.backend_port = port;
        }
    }
}

pub async fn run(config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    overrides.apply(&mut cfg);

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    if cfg.bootstrap.urls.is_empty() {
        anyhow::bail!("config: bootstrap.urls is empty; nothing to discover peers from");
    }

    tracing::info!(
        config = %resolved.path.display(),
        backend = %cfg.backend_listen_addr(),
        forward = %cfg.forward_target(),
        rendezvous = %cfg.rendezvous_bind_addr(),
        bootstrap_urls = cfg.bootstrap.urls.len(),
        admin_addr = %cfg.admin_addr,
        "punchgate: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let loader = Arc::new(BootstrapLoader::new(&cfg.bootstrap)?);
    let dir = loader.load(false).await.context("bootstrap: initial load")?;

    let ctx = ProxyContext::new(cfg);
    ctx.install_directory(dir);

    let mux = Multiplexer::new(&ctx.config).context("tunnel: domain_suffix pattern")?;
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<anyhow::Error>();
    let puncher = HolePuncher::new(ctx.clone(), mux.clone(), fatal_tx);

    let rendezvous = RendezvousClient::bind(ctx.clone(), puncher.clone())
        .await?
        .with_loader(loader);
    let backend_ln = backend::bind(&ctx.config.backend_listen_addr()).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { rendezvous.run(shutdown).await });
    }

    {
        let mux = mux.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { backend::serve_with_shutdown(backend_ln, mux, shutdown).await });
    }

    if !ctx.config.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&ctx.config.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", ctx.config.admin_addr))?;

        let state = admin::AdminState {
            prom: prom.clone(),
            ctx: ctx.clone(),
            puncher: puncher.clone(),
            mux: mux.clone(),
            config_path: resolved.path.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Node socket failures arrive here from punch tasks.
    tasks.spawn(async move {
        match fatal_rx.recv().await {
            Some(err) => Err(err),
            None => std::future::pending().await,
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(err = %format!("{err:#}"), "punchgate: fatal");
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while let Some(_res) = tasks.join_next().await {}
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_backend_address() {
        let mut cfg = config::Config::default();
        Overrides {
            backend_bind_ip: Some(" 0.0.0.0 ".into()),
            backend_port: Some(9100),
        }
        .apply(&mut cfg);
        assert_eq!(cfg.backend_listen_addr(), "0.0.0.0:9100");

        let mut untouched = config::Config::default();
        Overrides::default().apply(&mut untouched);
        assert_eq!(untouched.backend_listen_addr(), "127.0.0.1:8900");
    }
}
