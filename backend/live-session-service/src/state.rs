use std::sync::Arc;

use crate::config::Config;
use crate::services::LiveSessionCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: LiveSessionCoordinator,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(coordinator: LiveSessionCoordinator) -> Self {
        let config = Arc::new(coordinator.config().clone());
        Self { coordinator, config }
    }
}
