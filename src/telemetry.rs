//! Ecosystem telemetry: non-blocking recording of every verification attempt.
//!
//! The verifier enqueues one [`AttemptRecord`] per verdict into a bounded
//! drop-oldest queue and returns immediately; a single consumer task applies
//! each record to the fast counters and appends a row to the durable JSONL
//! log. The queue is the only coupling point: telemetry never calls back
//! into the verification path.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::verifier::verdict::FailureReason;

/// One verification attempt, as recorded by the engine.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Whether the attempt verified
    pub verified: bool,
    /// Failure reason, when not verified
    pub reason: Option<FailureReason>,
    /// Resolved JWKS URL, when resolution got that far
    pub jwks_url: Option<String>,
    /// `keyid` parameter, when present
    pub kid: Option<String>,
    /// Authority of the target URI (site-diversity tracking)
    pub origin: Option<String>,
    /// The signature carried no nonce and relied on timestamps alone
    pub weak_freshness: bool,
}

/// Durable log row (one JSON line per attempt).
#[derive(Debug, Serialize)]
struct LogRow<'a> {
    id: String,
    ts: String,
    verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwks_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    weak_freshness: bool,
}

// ── Fast counters ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DayBucket {
    signed: AtomicU64,
    verified: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default)]
struct AgentCounters {
    requests: AtomicU64,
    rejected: AtomicU64,
    origins: RwLock<BTreeSet<String>>,
    last_seen_unix: AtomicI64,
}

/// Aggregated ecosystem counters.
#[derive(Debug, Default)]
pub struct EcosystemStats {
    signed_total: AtomicU64,
    verified_total: AtomicU64,
    failed_total: AtomicU64,
    weak_freshness_total: AtomicU64,
    days: DashMap<String, DayBucket>,
    agents: DashMap<String, AgentCounters>,
}

impl EcosystemStats {
    fn apply(&self, record: &AttemptRecord) {
        self.signed_total.fetch_add(1, Ordering::Relaxed);
        if record.weak_freshness {
            self.weak_freshness_total.fetch_add(1, Ordering::Relaxed);
        }

        let day = Utc::now().format("%Y%m%d").to_string();
        let bucket = self.days.entry(day).or_default();
        bucket.signed.fetch_add(1, Ordering::Relaxed);
        if record.verified {
            self.verified_total.fetch_add(1, Ordering::Relaxed);
            bucket.verified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_total.fetch_add(1, Ordering::Relaxed);
            bucket.failed.fetch_add(1, Ordering::Relaxed);
        }
        drop(bucket);

        // Per-agent counters, keyed by directory (falling back to kid)
        let Some(agent_key) = record
            .jwks_url
            .as_deref()
            .or(record.kid.as_deref())
        else {
            return;
        };
        let agent = self.agents.entry(agent_key.to_string()).or_default();
        agent.requests.fetch_add(1, Ordering::Relaxed);
        if !record.verified {
            agent.rejected.fetch_add(1, Ordering::Relaxed);
        }
        agent.last_seen_unix.store(Utc::now().timestamp(), Ordering::Relaxed);
        if let Some(origin) = &record.origin {
            let known = agent.origins.read().contains(origin);
            if !known {
                agent.origins.write().insert(origin.clone());
            }
        }
    }

    /// Karma formula, derived offline from the counters:
    /// `requests/100 + unique_origins * 10`, zeroed when the rejection rate
    /// exceeds `rejection_threshold`.
    fn karma(requests: u64, rejected: u64, origins: u64, rejection_threshold: f64) -> u64 {
        #[allow(clippy::cast_precision_loss)]
        let rejection_rate = if requests > 0 {
            rejected as f64 / requests as f64
        } else {
            0.0
        };
        if rejection_rate > rejection_threshold {
            return 0;
        }
        requests / 100 + origins * 10
    }

    /// Snapshot the counters for the `/stats` surface.
    #[must_use]
    pub fn snapshot(&self, rejection_threshold: f64) -> StatsSnapshot {
        let mut days: Vec<DaySnapshot> = self
            .days
            .iter()
            .map(|entry| DaySnapshot {
                day: entry.key().clone(),
                signed: entry.signed.load(Ordering::Relaxed),
                verified: entry.verified.load(Ordering::Relaxed),
                failed: entry.failed.load(Ordering::Relaxed),
            })
            .collect();
        days.sort_by(|a, b| a.day.cmp(&b.day));

        let mut agents: Vec<AgentSnapshot> = self
            .agents
            .iter()
            .map(|entry| {
                let requests = entry.requests.load(Ordering::Relaxed);
                let rejected = entry.rejected.load(Ordering::Relaxed);
                let origins = entry.origins.read().len() as u64;
                AgentSnapshot {
                    agent: entry.key().clone(),
                    requests,
                    rejected,
                    unique_origins: origins,
                    last_seen_unix: entry.last_seen_unix.load(Ordering::Relaxed),
                    karma: Self::karma(requests, rejected, origins, rejection_threshold),
                }
            })
            .collect();
        agents.sort_by(|a, b| b.requests.cmp(&a.requests));

        StatsSnapshot {
            signed: self.signed_total.load(Ordering::Relaxed),
            verified: self.verified_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            weak_freshness: self.weak_freshness_total.load(Ordering::Relaxed),
            days,
            agents,
        }
    }
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Total signed attempts
    pub signed: u64,
    /// Total verified attempts
    pub verified: u64,
    /// Total failed attempts
    pub failed: u64,
    /// Attempts relying on timestamps alone (no nonce)
    pub weak_freshness: u64,
    /// Day-bucketed counters
    pub days: Vec<DaySnapshot>,
    /// Per-agent counters with derived karma
    pub agents: Vec<AgentSnapshot>,
}

/// One day bucket.
#[derive(Debug, Clone, Serialize)]
pub struct DaySnapshot {
    /// `YYYYMMDD`
    pub day: String,
    /// Signed attempts that day
    pub signed: u64,
    /// Verified attempts that day
    pub verified: u64,
    /// Failed attempts that day
    pub failed: u64,
}

/// Per-agent counters.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    /// Agent key (JWKS URL, or kid when resolution never completed)
    pub agent: String,
    /// Total attempts
    pub requests: u64,
    /// Rejected attempts
    pub rejected: u64,
    /// Distinct origins seen
    pub unique_origins: u64,
    /// Unix timestamp of the last attempt
    pub last_seen_unix: i64,
    /// Derived reputation score
    pub karma: u64,
}

// ── Queue and consumer ───────────────────────────────────────────────────────

/// Non-blocking telemetry front end.
pub struct Telemetry {
    enabled: bool,
    capacity: usize,
    queue: Mutex<VecDeque<AttemptRecord>>,
    wakeup: tokio::sync::Notify,
    dropped: AtomicU64,
    stats: EcosystemStats,
    log_path: String,
}

impl Telemetry {
    /// Create a telemetry pipeline (front end plus counters).
    #[must_use]
    pub fn new(enabled: bool, capacity: usize, log_path: String) -> Self {
        Self {
            enabled,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            wakeup: tokio::sync::Notify::new(),
            dropped: AtomicU64::new(0),
            stats: EcosystemStats::default(),
            log_path,
        }
    }

    /// Whether recording is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enqueue one attempt. Never blocks: under pressure the oldest queued
    /// record is dropped to make room.
    pub fn record(&self, record: AttemptRecord) {
        if !self.enabled {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.wakeup.notify_one();
    }

    /// Records dropped under queue pressure.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current queue backlog (consumer lag gauge).
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Counter access for the `/stats` surface.
    #[must_use]
    pub fn stats(&self) -> &EcosystemStats {
        &self.stats
    }

    fn drain(&self) -> Vec<AttemptRecord> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    /// Run the single consumer until `shutdown` fires, then flush the
    /// remaining queue.
    pub async fn run_consumer(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled {
            return;
        }
        debug!(path = %self.log_path, "Telemetry consumer started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.consume_batch().await;
                    debug!("Telemetry consumer stopped");
                    return;
                }
                () = self.wakeup.notified() => {
                    self.consume_batch().await;
                }
            }
        }
    }

    async fn consume_batch(&self) {
        let batch = self.drain();
        if batch.is_empty() {
            return;
        }

        for record in &batch {
            self.stats.apply(record);
        }

        if let Err(e) = self.append_rows(&batch).await {
            warn!("Telemetry log append failed: {e}");
        }
    }

    async fn append_rows(&self, batch: &[AttemptRecord]) -> std::io::Result<()> {
        let mut lines = String::new();
        for record in batch {
            let row = LogRow {
                id: Uuid::new_v4().to_string(),
                ts: Utc::now().to_rfc3339(),
                verified: record.verified,
                reason: record.reason.map(FailureReason::as_str),
                jwks_url: record.jwks_url.as_deref(),
                kid: record.kid.as_deref(),
                origin: record.origin.as_deref(),
                weak_freshness: record.weak_freshness,
            };
            if let Ok(json) = serde_json::to_string(&row) {
                lines.push_str(&json);
                lines.push('\n');
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await
    }
}
