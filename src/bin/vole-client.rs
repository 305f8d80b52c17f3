use clap::{Parser, Subcommand};
use vole::Clerk;

/// Actions that can be performed against the store.
#[derive(Debug, Subcommand)]
enum Action {
    /// Store a key-value pair.
    Put { key: String, value: String },

    /// Fetch the value stored under a key.
    Get { key: String },
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Address of the view service used to locate the primary.
    #[clap(long, default_value = "127.0.0.1:4000")]
    view_addr: String,

    #[clap(subcommand)]
    subcmd: Action,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let mut clerk = Clerk::new(app.view_addr);
    match app.subcmd {
        Action::Put { key, value } => clerk.put(&key, &value).await,
        Action::Get { key } => match clerk.get(&key).await {
            Some(value) => println!("{}", value),
            None => println!("Key not found"),
        },
    }
    Ok(())
}
