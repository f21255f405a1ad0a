mod command;
mod dnsmasq;
mod entry;
mod error;
mod handler;
mod pool;
mod prerequisites;
mod process;
mod ruleset;
mod server;

pub use error::PoolError;
pub use handler::{Body, MetadataHandler};
pub use pool::{Network, Pool, PoolConfig};
