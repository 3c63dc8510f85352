use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};

use super::Writer;
use crate::config::{ConfigStore, RetryConfig};
use crate::error::{AgentError, AgentResult};
use fleet_common::types::TelemetryEnvelope;

/// Bodies above this size are transport-compressed.
const GZIP_THRESHOLD_BYTES: usize = 1024;
/// Bounded store-and-forward queue; the oldest entry is evicted on overflow.
const MAX_QUEUE_LEN: usize = 100;
const RETRY_WAKE_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct QueuedEnvelope {
    envelope: TelemetryEnvelope,
    attempts: u32,
    next_attempt: DateTime<Utc>,
}

enum SendOutcome {
    Accepted,
    /// Client error worth neither retrying nor keeping.
    Dropped(String),
    AuthFailed,
    /// 429, 5xx or a transport failure.
    Retryable(String),
}

/// Posts envelopes to the ingest endpoint with gzip compression and a
/// bounded in-memory retry queue drained by a background task.
pub struct CloudWriter {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    queue: Mutex<VecDeque<QueuedEnvelope>>,
    reauth_needed: AtomicBool,
}

impl CloudWriter {
    pub fn new(client: reqwest::Client, config: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            queue: Mutex::new(VecDeque::new()),
            reauth_needed: AtomicBool::new(false),
        })
    }

    /// True once the server has rejected our token; cleared after
    /// re-registration succeeds.
    pub fn needs_reauth(&self) -> bool {
        self.reauth_needed.load(Ordering::Relaxed)
    }

    pub fn clear_reauth(&self) {
        self.reauth_needed.store(false, Ordering::Relaxed);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    async fn send_once(&self, envelope: &TelemetryEnvelope) -> SendOutcome {
        let config = self.config.snapshot();
        let Some(endpoint) = config.api_endpoint.as_deref() else {
            return SendOutcome::Dropped("no api_endpoint configured".to_string());
        };
        let Some(token) = config.auth_token.as_deref() else {
            return SendOutcome::AuthFailed;
        };

        let url = format!(
            "{}/v1/agents/{}/inventory",
            endpoint.trim_end_matches('/'),
            envelope.device_id
        );

        let body = match serde_json::to_vec(envelope) {
            Ok(body) => body,
            Err(e) => return SendOutcome::Dropped(format!("serialize failed: {e}")),
        };

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json");

        if body.len() > GZIP_THRESHOLD_BYTES {
            match gzip(&body) {
                Ok(compressed) => {
                    request = request.header(CONTENT_ENCODING, "gzip").body(compressed);
                }
                Err(e) => return SendOutcome::Dropped(format!("gzip failed: {e}")),
            }
        } else {
            request = request.body(body);
        }

        match request.send().await {
            Ok(resp) => match resp.status() {
                s if s.is_success() => SendOutcome::Accepted,
                StatusCode::UNAUTHORIZED => SendOutcome::AuthFailed,
                StatusCode::TOO_MANY_REQUESTS => {
                    SendOutcome::Retryable("rate limited".to_string())
                }
                s if s.is_client_error() => SendOutcome::Dropped(format!("rejected with {s}")),
                s => SendOutcome::Retryable(format!("server returned {s}")),
            },
            Err(e) => SendOutcome::Retryable(format!("network error: {e}")),
        }
    }

    fn enqueue(&self, envelope: TelemetryEnvelope) {
        let retry = self.config.snapshot().retry;
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        if queue.len() >= MAX_QUEUE_LEN {
            let evicted = queue.pop_front();
            if let Some(old) = evicted {
                warn!(seq = old.envelope.seq, "retry queue full, evicting oldest envelope");
            }
        }
        queue.push_back(QueuedEnvelope {
            envelope,
            attempts: 0,
            next_attempt: Utc::now() + backoff(&retry, 0),
        });
    }

    async fn drain_due(&self) {
        let now = Utc::now();
        let retry = self.config.snapshot().retry;

        // Pull due entries in FIFO order; the lock is not held across I/O.
        let due: Vec<QueuedEnvelope> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            let mut due = Vec::new();
            let mut rest = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if item.next_attempt <= now {
                    due.push(item);
                } else {
                    rest.push_back(item);
                }
            }
            *queue = rest;
            due
        };

        for mut item in due {
            if item.attempts >= retry.max_retries {
                warn!(
                    seq = item.envelope.seq,
                    attempts = item.attempts,
                    "dropping envelope after retry budget exhausted"
                );
                continue;
            }

            match self.send_once(&item.envelope).await {
                SendOutcome::Accepted => {
                    debug!(seq = item.envelope.seq, "queued envelope delivered");
                }
                SendOutcome::Dropped(reason) => {
                    warn!(seq = item.envelope.seq, %reason, "dropping queued envelope");
                }
                SendOutcome::AuthFailed => {
                    self.reauth_needed.store(true, Ordering::Relaxed);
                    warn!(seq = item.envelope.seq, "auth rejected, dropping queued envelope");
                }
                SendOutcome::Retryable(reason) => {
                    item.attempts += 1;
                    item.next_attempt = Utc::now() + backoff(&retry, item.attempts);
                    debug!(
                        seq = item.envelope.seq,
                        attempts = item.attempts,
                        %reason,
                        "requeueing envelope"
                    );
                    let mut queue = self.queue.lock().expect("queue lock poisoned");
                    if queue.len() >= MAX_QUEUE_LEN {
                        queue.pop_front();
                    }
                    queue.push_back(item);
                }
            }
        }
    }

    /// Background retry loop; wakes periodically and retries everything due.
    pub fn spawn_retry_loop(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_WAKE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => writer.drain_due().await,
                    _ = shutdown.changed() => {
                        info!(pending = writer.queue_len(), "cloud writer stopping");
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Writer for CloudWriter {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn write(&self, envelope: &TelemetryEnvelope) -> AgentResult<()> {
        match self.send_once(envelope).await {
            SendOutcome::Accepted => Ok(()),
            SendOutcome::Dropped(reason) => Err(AgentError::Writer(reason)),
            SendOutcome::AuthFailed => {
                self.reauth_needed.store(true, Ordering::Relaxed);
                error!("ingest rejected auth token, re-registration required");
                Err(AgentError::Writer("authentication failed".to_string()))
            }
            SendOutcome::Retryable(reason) => {
                self.enqueue(envelope.clone());
                Err(AgentError::Writer(format!("queued for retry: {reason}")))
            }
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// `base * multiplier^attempts`, clamped to the configured maximum.
fn backoff(retry: &RetryConfig, attempts: u32) -> chrono::Duration {
    let max = Duration::from_secs(retry.max_backoff_seconds);
    let factor = retry.backoff_multiplier.powi(attempts as i32);
    let raw = BACKOFF_BASE.as_secs_f64() * factor;
    let clamped = raw.min(max.as_secs_f64());
    chrono::Duration::milliseconds((clamped * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_writer() -> (Arc<CloudWriter>, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = ConfigStore::load(dir.path().join("config.json")).expect("config");
        let writer = CloudWriter::new(reqwest::Client::new(), Arc::new(store));
        (writer, dir)
    }

    fn envelope(seq: i64) -> TelemetryEnvelope {
        TelemetryEnvelope {
            device_id: uuid::Uuid::new_v4(),
            agent_version: "0.3.0".to_string(),
            collected_at: Utc::now(),
            seq,
            metrics: serde_json::Map::new(),
            tags: None,
        }
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let retry = RetryConfig {
            max_retries: 5,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 10,
        };
        assert_eq!(backoff(&retry, 0), chrono::Duration::seconds(1));
        assert_eq!(backoff(&retry, 1), chrono::Duration::seconds(2));
        assert_eq!(backoff(&retry, 3), chrono::Duration::seconds(8));
        // 2^5 = 32 clamps to the 10 s cap.
        assert_eq!(backoff(&retry, 5), chrono::Duration::seconds(10));
    }

    #[test]
    fn queue_is_bounded_and_evicts_oldest() {
        let (writer, _dir) = test_writer();

        for seq in 0..(MAX_QUEUE_LEN as i64 + 5) {
            writer.enqueue(envelope(seq));
        }
        assert_eq!(writer.queue_len(), MAX_QUEUE_LEN);

        // Entries 0..4 were evicted; the front is now seq 5.
        let queue = writer.queue.lock().expect("lock");
        assert_eq!(queue.front().expect("front").envelope.seq, 5);
        assert_eq!(
            queue.back().expect("back").envelope.seq,
            MAX_QUEUE_LEN as i64 + 4
        );
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let (writer, _dir) = test_writer();
        for seq in [3, 1, 7] {
            writer.enqueue(envelope(seq));
        }
        let queue = writer.queue.lock().expect("lock");
        let order: Vec<i64> = queue.iter().map(|q| q.envelope.seq).collect();
        assert_eq!(order, vec![3, 1, 7]);
    }

    #[test]
    fn gzip_round_trip() {
        use std::io::Read;

        let data = vec![b'a'; 4096];
        let compressed = gzip(&data).expect("gzip");
        assert!(compressed.len() < data.len());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("gunzip");
        assert_eq!(out, data);
    }
}
