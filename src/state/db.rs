//! Connection-pooled handle to the backing PostgreSQL database.
//!
//! All state mutations happen inside a transaction obtained from this
//! backend. The backend also owns the mapping between persisted filesystem
//! names and the live driver instances registered for this process.

use std::collections::HashMap;
use std::sync::Arc;

use postgres::{NoTls, Transaction};
use r2d2_postgres::PostgresConnectionManager;

use crate::config::PgConfig;
use crate::errors::StateError;
use crate::filesystem::Filesystem;

const POOL_SIZE: u32 = 4;

/// The embedded schema; executing it is idempotent.
pub const SCHEMA: &str = include_str!("schema.sql");

pub struct StateBackend {
    pool: r2d2::Pool<PostgresConnectionManager<NoTls>>,
    filesystems: HashMap<String, Arc<dyn Filesystem>>,
}

impl StateBackend {
    /// Connect to PostgreSQL; the pool establishes connections eagerly, so
    /// misconfiguration surfaces here rather than mid-job.
    pub fn connect(config: &PgConfig) -> Result<Self, StateError> {
        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username)
            .password(&config.password);

        let manager = PostgresConnectionManager::new(pg, NoTls);
        let pool = r2d2::Pool::builder().max_size(POOL_SIZE).build(manager)?;

        Ok(StateBackend {
            pool,
            filesystems: HashMap::new(),
        })
    }

    /// Add filesystem instances to the name mapping.
    pub fn register_filesystems(
        &mut self,
        filesystems: impl IntoIterator<Item = Arc<dyn Filesystem>>,
    ) {
        for filesystem in filesystems {
            self.filesystems
                .insert(filesystem.name().to_string(), filesystem);
        }
    }

    /// Resolve a persisted filesystem name to its registered instance.
    pub fn filesystem_convertor(&self, name: &str) -> Result<Arc<dyn Filesystem>, StateError> {
        self.filesystems
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| StateError::Backend(format!("no filesystem registered as {name}")))
    }

    /// Run a batch of statements outside any explicit transaction. Used for
    /// the (idempotent) schema bootstrap.
    pub fn execute_script(&self, script: &str) -> Result<(), StateError> {
        let mut connection = self.pool.get()?;
        connection.batch_execute(script)?;
        Ok(())
    }

    /// Scoped unit of atomicity: the closure's statements commit together or
    /// not at all.
    pub fn transaction<T>(
        &self,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut connection = self.pool.get()?;
        let mut transaction = connection.transaction()?;
        let value = body(&mut transaction)?;
        transaction.commit()?;
        Ok(value)
    }
}

/// Row-level locking primitive: takes an exclusive lock on a table for the
/// remainder of the enclosing transaction.
pub fn lock(transaction: &mut Transaction<'_>, table: &str) -> Result<(), StateError> {
    // Table names come from this crate, never from user input
    transaction.batch_execute(&format!("lock table {table} in access exclusive mode"))?;
    Ok(())
}
