use clap::Parser;
use std::net::SocketAddr;
use tokio::signal::ctrl_c;
use tracing::{error, info};
use vole::ViewServer;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    #[clap(long, default_value = "127.0.0.1:4000")]
    addr: SocketAddr,

    #[clap(long, default_value = "info", env = "VOLE_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    info!("vole-view version: {}", env!("CARGO_PKG_VERSION"));
    let server = ViewServer::new(app.addr);
    let handle = server.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("view service failed: {e}");
            std::process::exit(1);
        }
    });

    match ctrl_c().await {
        Ok(_) => info!("received shutdown signal"),
        Err(e) => error!("error receiving ctrl-c: {e}"),
    }
    handle.shutdown();
    Ok(())
}
