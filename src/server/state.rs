use std::sync::Arc;

use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionManager};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub connection_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let limits = ConnectionLimits::from(&settings.connection);
        let connection_manager = Arc::new(ConnectionManager::with_limits(limits));
        Self::with_manager(settings, connection_manager)
    }

    pub fn with_manager(settings: Settings, connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            settings: Arc::new(settings),
            connection_manager,
        }
    }
}
