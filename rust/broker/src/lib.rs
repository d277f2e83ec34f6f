//! intelmux is a lookup broker for threat intelligence: capture agents ask
//! it about indicators (addresses, domains, hashes, URLs) and it fans each
//! query out to its configured sources, caches what they answer, collapses
//! duplicate in-flight fetches, and hands back one combined, compactly
//! encoded result.
//!
//! The wire formats live in the `intelwire` crate; this crate is the
//! service around them: configuration, sources, the broker itself, and the
//! HTTP surface.

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod registry;
pub mod server;
pub mod source;
pub mod state;
pub mod telemetry;

use crate::config::Config;
use crate::server::Server;

/// Boot the service and serve until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    Server::new(config).await?.run().await
}
