//! Dependency health lookups against a pub.dev-shaped package index.
//!
//! Given a list of package names, [`DependencyHealthClient::check_all`] fetches
//! `{pub_dev_base_url}/api/packages/<name>` for each with bounded parallelism,
//! per-request timeout, retry/backoff on transient failures, and a 24-hour
//! per-package TTL cache. A package that stays unreachable after retries
//! degrades to a conservative default rather than failing the whole batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::FlydConfig;

/// Health verdict for a single package.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PackageHealth {
    pub name: String,
    pub health_score: u8,
    pub vulnerabilities: Vec<String>,
    pub license: String,
    pub is_maintained: bool,
    pub popularity: u8,
}

impl PackageHealth {
    /// The conservative default returned for a package that stayed
    /// unreachable after every retry — the batch never fails outright.
    fn unreachable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            health_score: 50,
            vulnerabilities: Vec::new(),
            license: "Unknown".to_string(),
            is_maintained: false,
            popularity: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedHealth {
    health: PackageHealth,
    fetched_at: DateTime<Utc>,
}

/// Raw shape returned by `GET /api/packages/<name>` — only the fields the
/// health heuristic needs.
#[derive(Debug, Deserialize)]
struct PackageIndexResponse {
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    popularity: Option<f64>,
    #[serde(default)]
    has_documentation: bool,
    #[serde(default)]
    has_example: bool,
    #[serde(default)]
    vulnerabilities: Vec<String>,
}

#[derive(Debug)]
enum FetchError {
    Timeout,
    ConnectionReset,
    Status(u16),
    Other(String),
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::ConnectionReset | FetchError::Status(429)
        ) || matches!(self, FetchError::Status(s) if *s >= 500)
    }
}

/// Parallel, TTL-cached pub.dev dependency-health lookups.
///
/// Owned by [`crate::AppContext`] as a process-scoped instance — never a
/// static — so tests can construct a fresh client with its own cache and
/// mock HTTP base URL.
pub struct DependencyHealthClient {
    client: reqwest::Client,
    base_url: String,
    semaphore: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
    ttl: chrono::Duration,
    cache: DashMap<String, CachedHealth>,
}

impl DependencyHealthClient {
    pub fn new(config: &FlydConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.pub_dev_base_url.clone(),
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.health_concurrency)),
            timeout: config.health_timeout,
            ttl: config.health_ttl,
            cache: DashMap::new(),
        }
    }

    pub fn new_for_tests(config: Arc<FlydConfig>) -> Self {
        Self::new(&config)
    }

    /// Fetch health data for every package in `names`, bounded by the
    /// configured concurrency cap. Order of the result matches `names`.
    pub async fn check_all(&self, names: &[String]) -> Vec<PackageHealth> {
        let futures = names.iter().map(|name| self.check_one(name));
        futures::future::join_all(futures).await
    }

    /// Fetch health data for a single package, serving the cache when fresh.
    pub async fn check_one(&self, name: &str) -> PackageHealth {
        if let Some(entry) = self.cache.get(name) {
            if Utc::now() - entry.fetched_at < self.ttl {
                return entry.health.clone();
            }
        }

        let _permit = self.semaphore.acquire().await;
        let retry_config = RetryConfig::health_lookup();
        let result = retry_with_backoff(
            &retry_config,
            FetchError::is_retryable,
            || self.fetch_one(name),
        )
        .await;

        let health = match result {
            Ok(health) => health,
            Err(e) => {
                warn!(package = name, error = ?e, "dependency health lookup failed after retries");
                PackageHealth::unreachable(name)
            }
        };

        self.cache.insert(
            name.to_string(),
            CachedHealth { health: health.clone(), fetched_at: Utc::now() },
        );
        health
    }

    async fn fetch_one(&self, name: &str) -> Result<PackageHealth, FetchError> {
        let url = format!("{}/api/packages/{name}", self.base_url);
        let response = tokio::time::timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else if e.is_connect() {
                    FetchError::ConnectionReset
                } else {
                    FetchError::Other(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body: PackageIndexResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?;

        debug!(package = name, "dependency health lookup succeeded");
        Ok(score(name, &body))
    }
}

/// The deterministic health-score heuristic the test suite pins against.
fn score(name: &str, info: &PackageIndexResponse) -> PackageHealth {
    let now = Utc::now();
    let days_since_update = info
        .last_updated
        .map(|t| (now - t).num_days())
        .unwrap_or(i64::MAX);
    let is_maintained = days_since_update <= 365;
    let popularity = info.popularity.unwrap_or(0.0).clamp(0.0, 100.0) as u8;

    let mut points: i32 = 100;
    if !is_maintained {
        points -= 30;
    }
    if days_since_update > 365 {
        points -= 20;
    } else if days_since_update > 180 {
        points -= 10;
    }
    if popularity < 10 {
        points -= 15;
    } else if popularity < 50 {
        points -= 5;
    }
    if !info.has_documentation {
        points -= 10;
    }
    if !info.has_example {
        points -= 5;
    }

    PackageHealth {
        name: name.to_string(),
        health_score: points.clamp(0, 100) as u8,
        vulnerabilities: info.vulnerabilities.clone(),
        license: info.license.clone().unwrap_or_else(|| "Unknown".to_string()),
        is_maintained,
        popularity,
    }
}
