mod punchgate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "punchgate",
    version,
    about = "punchgate - peer-to-peer HTTP gateway over NAT hole punching"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses PUNCHGATE_CONFIG; then auto-detects punchgate.toml > punchgate.yaml > punchgate.yml from CWD; then falls back to the OS default path (Linux: /etc/punchgate/punchgate.toml; others: user config dir).
    #[arg(long, env = "PUNCHGATE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// IP the Backend Listener binds to. Overrides `backend_bind_ip`.
    #[arg(long, env = "PUNCHGATE_BACKEND_BIND_IP")]
    backend_bind_ip: Option<String>,

    /// Port the Backend Listener binds to. Overrides `backend_port`.
    #[arg(long, env = "PUNCHGATE_BACKEND_PORT")]
    backend_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    punchgate::run(
        cli.config,
        punchgate::Overrides {
            backend_bind_ip: cli.backend_bind_ip,
            backend_port: cli.backend_port,
        },
    )
    .await
}
