pub mod admin;
pub mod app;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod ids;
pub mod logging;
pub mod net;
pub mod punch;
pub mod rendezvous;
pub mod telemetry;
pub mod tunnel;

pub use app::Overrides;

pub async fn run(config_path: Option<std::path::PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
