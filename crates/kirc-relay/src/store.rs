use std::sync::Arc;

use anyhow::anyhow;
use tracing::error;

use kirc_db::Database;
use kirc_types::{KircError, Result};

/// Run a blocking database call off the async workers.
pub(crate) async fn with_db<F, T>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            KircError::Store(anyhow!("database task failed: {}", e))
        })?
        .map_err(KircError::Store)
}
