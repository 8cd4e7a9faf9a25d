use db::{DbConfig, DbError, SurrealStore};

/// Open a store on a fresh in-memory datastore; each call is isolated.
pub async fn setup_store() -> Result<SurrealStore, DbError> {
    SurrealStore::open(&DbConfig::memory().with_database("test")).await
}
