use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use fleet_common::error::{AppError, AppResult};

const CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connect with a bounded retry budget, then run migrations. Exhausting the
/// budget is a fatal startup error.
pub async fn connect_and_migrate(database_url: &str) -> AppResult<PgPool> {
    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!(attempt, "database connected");
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| AppError::External(format!("migrations failed: {e}")))?;
                return Ok(pool);
            }
            Err(e) => {
                warn!(attempt, error = %e, "database connect failed, retrying");
                last_error = Some(e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }

    Err(AppError::External(format!(
        "database unreachable after {CONNECT_ATTEMPTS} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

pub async fn ping(pool: &PgPool) -> AppResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| AppError::External(format!("database ping failed: {e}")))?;
    Ok(())
}
