pub mod admin;
pub mod app;
pub mod codec;
pub mod config;
pub mod control;
pub mod handshake;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod routes;
pub mod telemetry;

pub async fn run(opts: config::Options) -> anyhow::Result<()> {
    app::run(opts).await
}
