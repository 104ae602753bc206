//! Store registry
//!
//! The registry is an ordinary value built by the caller at startup; nothing
//! registers itself globally. Backends are looked up by name and constructed
//! from a list of endpoints plus an optional [`Config`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{info, warn};

use kvstore_common::{Config, Result, Store, StoreError};
use kvstore_etcd::{EtcdConnector, EtcdStore};
use kvstore_zookeeper::{ZkConnector, ZookeeperStore};

use crate::backend::Backend;
use crate::settings::StoreSettings;

/// Future returned by a backend constructor
pub type StoreFuture = BoxFuture<'static, Result<Arc<dyn Store>>>;

/// Builds a store from endpoints and configuration
pub type Constructor = Arc<dyn Fn(Vec<String>, Option<Config>) -> StoreFuture + Send + Sync>;

/// Map from backend name to constructor
#[derive(Clone, Default)]
pub struct StoreRegistry {
    constructors: HashMap<String, Constructor>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both built-in backends bound to the given connectors.
    pub fn with_builtin(etcd: Arc<dyn EtcdConnector>, zookeeper: Arc<dyn ZkConnector>) -> Self {
        let mut registry = Self::new();
        registry.register_etcd(etcd);
        registry.register_zookeeper(zookeeper);
        registry
    }

    /// Register `ctor` under `name`, replacing any earlier registration.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(Vec<String>, Option<Config>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Store>>> + Send + 'static,
    {
        let name = name.into();
        let ctor: Constructor = Arc::new(move |endpoints, config| ctor(endpoints, config).boxed());
        if self.constructors.insert(name.clone(), ctor).is_some() {
            warn!("Backend '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn register_etcd(&mut self, connector: Arc<dyn EtcdConnector>) {
        self.register(Backend::Etcd.as_str(), move |endpoints, config| {
            let connector = connector.clone();
            async move {
                let store =
                    EtcdStore::connect(connector.as_ref(), &endpoints, config.as_ref()).await?;
                Ok(Arc::new(store) as Arc<dyn Store>)
            }
        });
    }

    pub fn register_zookeeper(&mut self, connector: Arc<dyn ZkConnector>) {
        self.register(Backend::Zookeeper.as_str(), move |endpoints, config| {
            let connector = connector.clone();
            async move {
                let store =
                    ZookeeperStore::connect(connector.as_ref(), &endpoints, config.as_ref())
                        .await?;
                Ok(Arc::new(store) as Arc<dyn Store>)
            }
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct the store registered under `name`.
    pub async fn new_store(
        &self,
        name: &str,
        endpoints: &[String],
        config: Option<Config>,
    ) -> Result<Arc<dyn Store>> {
        let ctor = self
            .constructors
            .get(name)
            .ok_or_else(|| StoreError::BackendNotSupported(name.to_string()))?;

        info!("Creating '{}' store for {:?}", name, endpoints);
        ctor(endpoints.to_vec(), config).await
    }

    /// Construct the store described by `settings`.
    pub async fn from_settings(&self, settings: &StoreSettings) -> Result<Arc<dyn Store>> {
        self.new_store(
            &settings.backend,
            &settings.endpoints,
            Some(settings.to_config()),
        )
        .await
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
