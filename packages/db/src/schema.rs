//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes. Safe to run repeatedly.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(GROUP_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
///
/// The job document is stored as JSON text under `document`; the top-level
/// fields are copies used for filtering, ordering and guarded transitions.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

-- Indexes for efficient job queries
DEFINE INDEX IF NOT EXISTS job_queue ON job FIELDS queue_name;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_group ON job FIELDS group_id;

-- Compound index for batch loads (waiting jobs by priority and age)
DEFINE INDEX IF NOT EXISTS job_queue_waiting ON job FIELDS queue_name, status, priority_rank, created_ns;

-- Running jobs by attempt start, for reclaiming abandoned work
DEFINE INDEX IF NOT EXISTS job_queue_running ON job FIELDS queue_name, status, started_ns;
"#;

/// Group table schema.
const GROUP_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_group SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_group_queue ON job_group FIELDS queue_name;
DEFINE INDEX IF NOT EXISTS job_group_status ON job_group FIELDS queue_name, status;
"#;
