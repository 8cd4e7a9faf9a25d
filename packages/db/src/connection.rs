//! Database connection management.

use queue_core::StoreError;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle. Cheap to clone.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection endpoint, e.g. "mem://" or "rocksdb://path" (rocksdb feature)
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobqueue".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Use an explicit endpoint string.
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Build a config from `DB_*` keys. Blank values count as unset.
    ///
    /// `DB_USER` and `DB_PASS` only take effect together.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = match get("DB_ENDPOINT") {
            Some(endpoint) => Self::endpoint(endpoint),
            None => Self::memory(),
        };
        if let Some(namespace) = get("DB_NAMESPACE") {
            config = config.with_namespace(namespace);
        }
        if let Some(database) = get("DB_DATABASE") {
            config = config.with_database(database);
        }
        if let (Some(user), Some(pass)) = (get("DB_USER"), get("DB_PASS")) {
            config = config.with_credentials(user, pass);
        }
        config
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Whether the transaction lost a read/write race and may be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DbError::Database(surrealdb::Error::Db(surrealdb::error::Db::TxRetryable))
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Sort a driver error into the store error kinds the engine reacts to.
fn classify(err: surrealdb::Error) -> StoreError {
    use surrealdb::error::{Api, Db};

    let message = err.to_string();
    match err {
        surrealdb::Error::Db(Db::TxRetryable) => StoreError::Conflict(message),
        surrealdb::Error::Db(Db::Serialization(_)) => StoreError::Serialization(message),
        surrealdb::Error::Db(_) => StoreError::Query(message),
        surrealdb::Error::Api(api) => match api {
            Api::Http(_)
            | Api::Ws(_)
            | Api::Scheme(_)
            | Api::InvalidUrl(_)
            | Api::ConnectionUninitialised => StoreError::Connection(message),
            Api::FromValue { .. }
            | Api::DeSerializeValue(_)
            | Api::Serializer(_)
            | Api::Deserializer(_) => StoreError::Serialization(message),
            _ => StoreError::Query(message),
        },
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Database(e) => classify(e),
            DbError::Query(msg) => StoreError::Query(msg),
            DbError::NotFound(msg) => StoreError::NotFound(msg),
            DbError::InvalidState(msg) => StoreError::InvalidState(msg),
            DbError::Serialization(msg) => StoreError::Serialization(msg),
        }
    }
}

/// Open a connection and select the configured namespace and database.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect_any(config.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
