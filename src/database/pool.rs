use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use super::error::StoreError;
use crate::config::DatabaseConfig;

/// Open a pool against `DATABASE_URL` and ping it once.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let url = config
        .url
        .as_deref()
        .ok_or(StoreError::ConfigMissing("DATABASE_URL"))?;
    let shown = redact(url)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout))
        .connect(url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("Connected to database: {}", shown);
    Ok(pool)
}

/// Connection string safe for logs: the password is masked.
pub fn redact(raw: &str) -> Result<String, StoreError> {
    let mut url = url::Url::parse(raw).map_err(|_| StoreError::InvalidDatabaseUrl)?;
    if url.password().is_some() {
        url.set_password(Some("****")).map_err(|_| StoreError::InvalidDatabaseUrl)?;
    }
    Ok(url.into())
}
