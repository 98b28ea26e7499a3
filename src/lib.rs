use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod routes;

use config::Config;
use db::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
}

impl AppState {
    /// Opens the store named by the configuration and applies the schema.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let db = db::init_pool(&config.database_path).await?;
        Ok(Self {
            db,
            config: Arc::new(config),
        })
    }
}
