use std::sync::Arc;

use crate::broker::Broker;
use crate::cache::epoch_secs;
use crate::config::Config;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<Broker>,
    /// Epoch seconds when the service booted.
    pub started_at: u64,
}

impl AppState {
    pub fn new(config: Arc<Config>, broker: Arc<Broker>) -> AppState {
        AppState {
            config,
            broker,
            started_at: epoch_secs(),
        }
    }
}
