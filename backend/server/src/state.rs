use std::sync::Arc;

use redis::RedisError;
use tracing::{info, warn};

use super::{
    certificates::{CertificateService, SystemClock},
    config::{Config, StoreBackend},
    database::{RedisStore, init_redis},
    memory::MemoryStore,
    store::CertificateStore,
};

pub struct AppState {
    pub config: Config,
    pub service: CertificateService,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>, RedisError> {
        let store = build_store(&config).await?;

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn CertificateStore>) -> Arc<Self> {
        let service = CertificateService::new(
            store,
            config.pepper.clone(),
            config.retired_peppers.clone(),
            Arc::new(SystemClock),
            config.store_timeout,
            config.public_base_url.clone(),
        );

        Arc::new(Self { config, service })
    }
}

pub async fn build_store(config: &Config) -> Result<Arc<dyn CertificateStore>, RedisError> {
    match config.store {
        StoreBackend::Redis => {
            info!("Connecting to Redis...");
            let connection = init_redis(&config.redis_url).await?;

            Ok(Arc::new(RedisStore::new(connection)))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store, certificates will not survive a restart");

            Ok(MemoryStore::new())
        }
    }
}
