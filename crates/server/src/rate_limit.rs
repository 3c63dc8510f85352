//! Sliding-window request limiter.
//!
//! Agent routes are keyed by the device id in the path so one chatty device
//! cannot starve the fleet; everything else is keyed by client address.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::state::AppState;
use fleet_common::error::AppError;

struct Bucket {
    window_start: Instant,
    previous: u32,
    current: u32,
}

pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            buckets: DashMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Weighted sliding-window check: the previous window's count decays
    /// linearly as the current window progresses.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            window_start: now,
            previous: 0,
            current: 0,
        });

        let elapsed = now.duration_since(bucket.window_start);
        if elapsed >= self.window * 2 {
            bucket.window_start = now;
            bucket.previous = 0;
            bucket.current = 0;
        } else if elapsed >= self.window {
            bucket.window_start += self.window;
            bucket.previous = bucket.current;
            bucket.current = 0;
        }

        let frac = now
            .duration_since(bucket.window_start)
            .as_secs_f64()
            .min(self.window.as_secs_f64())
            / self.window.as_secs_f64();
        let weighted = f64::from(bucket.previous) * (1.0 - frac) + f64::from(bucket.current);

        if weighted >= f64::from(self.max_per_window) {
            return false;
        }
        bucket.current += 1;
        true
    }
}

pub async fn limit(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = device_key(request.uri().path())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    if !state.limiter.allow(&key) {
        return Err(AppError::RateLimited);
    }
    Ok(next.run(request).await)
}

/// Agent routes are limited per device: `/v1/agents/{id}/...` keys on the id
/// segment.
fn device_key(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v1/agents/")?;
    let id = rest.split('/').next()?;
    if id.is_empty() || id == "register" {
        return None;
    }
    Some(id)
}
