use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::config::ServerConfig;
use crate::ingest::LogPublisher;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: PgPool,
    pub log: LogPublisher,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: PgPool, log: LogPublisher) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_rps,
            std::time::Duration::from_secs(60),
        ));
        Self {
            config: Arc::new(config),
            db,
            log,
            limiter,
            started_at: Instant::now(),
        }
    }
}
