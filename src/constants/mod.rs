use std::str::FromStr;

use crate::api::error;

/// Upper bound on group membership when `MAX_GROUP_MEMBERS` is not set.
pub const DEFAULT_MAX_GROUP_MEMBERS: i32 = 200;

/// Both participants of a dialog are owners, and there are never more than two.
pub const DIALOG_MEMBERS: i32 = 2;

#[derive(Debug, Clone)]
pub struct Env {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_group_members: i32,
}

impl Env {
    pub fn from_env() -> Result<Self, error::SystemError> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            error::SystemError::config("DATABASE_URL must be set in .env file or environment variable")
        })?;

        let max_connections = var_or("DB_MAX_CONNECTIONS", 5u32)?;
        let min_connections = var_or("DB_MIN_CONNECTIONS", 1u32)?;

        let max_group_members = var_or("MAX_GROUP_MEMBERS", DEFAULT_MAX_GROUP_MEMBERS)?;
        if max_group_members < 1 {
            return Err(error::SystemError::config("MAX_GROUP_MEMBERS must be at least 1"));
        }

        log::info!("Environment variables loaded");
        Ok(Env { database_url, max_connections, min_connections, max_group_members })
    }
}

fn var_or<T: FromStr>(key: &'static str, default: T) -> Result<T, error::SystemError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| error::SystemError::config(format!("{key} must be a valid number"))),
        Err(_) => Ok(default),
    }
}
