//! Entry point tying configuration, routing manager and applications
//! together.
//!
//! There is no global singleton: a [`Runtime`] is constructed once (usually
//! from the `SOMEIP_CONFIGURATION` environment variable) and handed to
//! whoever creates applications. The process whose application name matches
//! the configured `routing` name hosts the routing manager; everyone else
//! just attaches to its socket.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::application::Application;
use crate::config::Config;
use crate::error::Result;
use crate::routing::RoutingManager;

pub struct Runtime {
    config: Arc<Config>,
    routing: Mutex<Option<Arc<RoutingManager>>>,
}

impl Runtime {
    pub fn new(config: Config) -> Runtime {
        Runtime {
            config: Arc::new(config),
            routing: Mutex::new(None),
        }
    }

    /// Builds a runtime from `SOMEIP_CONFIGURATION` (JSON file path); falls
    /// back to the built-in defaults when unset.
    pub fn from_env() -> Result<Runtime> {
        let config = match std::env::var_os(crate::CONFIGURATION_ENV) {
            Some(path) => Config::load(Path::new(&path))?,
            None => Config::default(),
        };
        Ok(Runtime::new(config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True when `name` is configured to host the routing manager.
    pub fn is_routing(&self, name: &str) -> bool {
        self.config.routing == name
    }

    /// Creates an application. For the routing host this also starts the
    /// routing manager before attaching.
    pub async fn create_application(&self, name: &str) -> Result<Application> {
        if self.is_routing(name) {
            let mut routing = self.routing.lock().await;
            if routing.is_none() {
                let manager = RoutingManager::start(self.config.clone()).await?;
                *routing = Some(Arc::new(manager));
            }
        }

        Application::connect(self.config.clone(), name).await
    }

    /// Handle to the hosted routing manager, if this process hosts one.
    pub async fn routing_manager(&self) -> Option<Arc<RoutingManager>> {
        self.routing.lock().await.clone()
    }

    /// Stops the hosted routing manager (final StopOffers, endpoints
    /// closed).
    pub async fn shutdown(&self) {
        let routing = self.routing.lock().await.take();
        if let Some(manager) = routing {
            manager.shutdown().await;
        }
    }
}
