//! A fault-tolerant in-memory key/value store built from two cooperating
//! services: a view service that assigns a primary/backup pair out of a
//! fleet of servers, and the KV servers themselves, where the primary
//! synchronously forwards every write to the backup so a single server
//! failure loses no acknowledged data.

use std::time::Duration;

pub mod client;
pub mod error;
pub mod server;
pub mod view;
pub mod viewservice;

pub use client::{Clerk, ViewClerk};
pub use error::Error;
pub use server::KvServer;
pub use view::View;
pub use viewservice::ViewServer;

pub mod proto {
    tonic::include_proto!("vole");
}

pub type Result<T> = std::result::Result<T, Error>;

/// Heartbeat period. Every server pings the view service once per
/// interval, and the view service reassigns roles on the same cadence.
pub const PING_INTERVAL: Duration = Duration::from_millis(100);

/// Number of missed ping intervals after which a role-holder is
/// presumed dead.
pub const DEAD_PINGS: u32 = 5;

/// How long a server may go without pinging before the view service
/// treats it as dead.
pub fn dead_interval() -> Duration {
    DEAD_PINGS * PING_INTERVAL
}
