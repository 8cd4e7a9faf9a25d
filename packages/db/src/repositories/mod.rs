//! Repository implementations for database operations.

mod group_repo;
mod job_repo;

pub use group_repo::GroupRepository;
pub use job_repo::{JobFilter, JobRepository};

use std::future::Future;
use std::time::Duration;

use crate::DbError;

/// Attempts made for a write that keeps losing transaction races.
const CONFLICT_ATTEMPTS: u32 = 5;

/// Run `op` again while it fails with a transaction conflict, backing off a
/// little more after each loss.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                tracing::debug!("Write conflict on attempt {}, retrying: {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
