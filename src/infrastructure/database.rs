//! Pooled SQLite connection

use crate::config::AppConfig;
use crate::infrastructure::traits::PersistenceError;
use di::{Ref, inject, injectable};
use log::info;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::ops::Deref;

pub struct DatabaseConnection {
    connection: SqlitePool,
}

#[injectable]
impl DatabaseConnection {
    #[inject]
    pub fn create(config: Ref<AppConfig>) -> DatabaseConnection {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(config.database.clone());

        DatabaseConnection { connection: pool }
    }
}

impl DatabaseConnection {
    /// Wraps an existing pool, e.g. an in-memory database in tests.
    pub fn from_pool(pool: SqlitePool) -> DatabaseConnection {
        DatabaseConnection { connection: pool }
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!().run(&self.connection).await?;
        info!("database schema is up to date");
        Ok(())
    }
}

impl Deref for DatabaseConnection {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}
