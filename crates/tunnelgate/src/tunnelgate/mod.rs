pub mod admin;
pub mod app;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod pool;
pub mod router;
pub mod telemetry;
pub mod tunnel;
pub mod wire;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    local_port: Option<u16>,
) -> anyhow::Result<()> {
    app::run(config_path, local_port).await
}
