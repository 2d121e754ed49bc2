use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{
    api::error::{self, StorageResultExt},
    constants::Env,
};

/// Installs `env_logger` for hosts that do not bring their own logger.
pub fn init_logging() {
    if env_logger::try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

pub async fn connect_database(env: &Env) -> Result<PgPool, error::SystemError> {
    let pool = PgPoolOptions::new()
        .max_connections(env.max_connections)
        .min_connections(env.min_connections)
        .acquire_slow_threshold(std::time::Duration::from_secs(3))
        .connect(&env.database_url)
        .await
        .op("connect_database")?;
    log::info!("Connected to database (max {} connections)", env.max_connections);
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), error::SystemError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    log::info!("Chat schema is up to date");
    Ok(())
}
