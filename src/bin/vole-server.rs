use clap::Parser;
use tokio::signal::ctrl_c;
use tracing::{error, info};
use vole::KvServer;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Address to listen on; also this server's identity towards the
    /// view service.
    #[clap(long, default_value = "127.0.0.1:4100")]
    addr: String,

    /// Address of the view service.
    #[clap(long, default_value = "127.0.0.1:4000")]
    view_addr: String,

    #[clap(long, default_value = "info", env = "VOLE_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    info!("vole-server version: {}", env!("CARGO_PKG_VERSION"));
    let server = KvServer::new(app.addr, app.view_addr)?;
    let handle = server.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("kv server failed: {e}");
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
