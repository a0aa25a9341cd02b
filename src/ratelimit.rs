use crate::error::Error;
use crate::metrics::Metrics;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Consecutive 429s on one call before giving up
const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 10;

/// Wait used when a 429 carries no retry information
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// A REST endpoint: method plus path template.
///
/// Path parameters do not fragment buckets, so `/channels/1/messages` and
/// `/channels/2/messages` share the bucket of `/channels/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: String,
    path: String,
}

impl Route {
    pub fn new(method: Method, template: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            path: path.into(),
        }
    }

    /// Build a route from a literal path, replacing numeric segments with
    /// `{id}`. The query string is kept in the path but not the template.
    pub fn from_path(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let without_query = path.split('?').next().unwrap_or_default();
        let template = without_query
            .split('/')
            .map(|segment| {
                if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                    "{id}"
                } else {
                    segment
                }
            })
            .collect::<Vec<_>>()
            .join("/");

        Self {
            method,
            template,
            path,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Concrete path, including any query string
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Key of the bucket this route is limited by
    pub fn bucket_key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Rate-limit metadata from response headers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the bucket refills
    pub reset_after: Option<Duration>,
    /// Server-side bucket hash
    pub bucket: Option<String>,
    /// The limit applies to every route
    pub global: bool,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
        };

        Self {
            limit: text("x-ratelimit-limit").and_then(|v| v.trim().parse().ok()),
            remaining: text("x-ratelimit-remaining").and_then(|v| v.trim().parse().ok()),
            reset_after: seconds("x-ratelimit-reset-after"),
            bucket: text("x-ratelimit-bucket").map(str::to_string),
            global: text("x-ratelimit-global")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            retry_after: seconds("retry-after"),
        }
    }
}

/// Body of a 429 response
#[derive(Debug, Deserialize)]
struct ThrottleBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// An HTTP response as seen by the limiter
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_throttled(&self) -> bool {
        self.status == 429
    }
}

#[derive(Debug, Default)]
struct BucketState {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    server_bucket: Option<String>,
}

impl BucketState {
    /// When the next call may start, if it has to wait
    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at),
            _ => None,
        }
    }

    fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if headers.limit.is_some() {
            self.limit = headers.limit;
        }
        if headers.remaining.is_some() {
            self.remaining = headers.remaining;
        }
        if let Some(reset_after) = headers.reset_after {
            self.reset_at = Some(now + reset_after);
        }
        if headers.bucket.is_some() {
            self.server_bucket = headers.bucket.clone();
        }
    }
}

struct Bucket {
    /// Calls take turns through this queue; the turn is held for the whole
    /// call so same-bucket calls never overlap
    turn: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState::default()),
        }
    }
}

/// Schedules REST calls so each bucket stays within its quota.
///
/// Calls on one bucket run strictly one after another and wait for the
/// bucket's reset when its quota is spent. Calls on different buckets run
/// in parallel. A 429 is retried after the server's `retry_after`, so
/// callers only ever see the final answer.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    /// Set by a global 429; every bucket waits for it
    global_until: Mutex<Option<Instant>>,
    max_throttle_retries: u32,
    metrics: Option<Arc<Metrics>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            global_until: Mutex::new(None),
            max_throttle_retries: DEFAULT_MAX_THROTTLE_RETRIES,
            metrics: None,
        }
    }

    /// Record requests and rate-limit hits into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Give up with [`Error::RateLimited`] after this many consecutive 429s
    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    /// Number of buckets seen so far
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Remaining quota last reported for `route`'s bucket
    pub fn remaining(&self, route: &Route) -> Option<u32> {
        self.buckets
            .lock()
            .get(&route.bucket_key())
            .and_then(|b| b.state.lock().remaining)
    }

    fn bucket(&self, route: &Route) -> Arc<Bucket> {
        self.buckets
            .lock()
            .entry(route.bucket_key())
            .or_insert_with(|| {
                debug!("Creating rate limit bucket {}", route.bucket_key());
                Arc::new(Bucket::new())
            })
            .clone()
    }

    async fn wait_global(&self) {
        loop {
            let until = *self.global_until.lock();
            match until {
                Some(until) if until > Instant::now() => sleep_until(until).await,
                _ => return,
            }
        }
    }

    /// Run `send` for `route` under the route's bucket.
    ///
    /// `send` is called once per attempt; it is called again only after a
    /// 429. Transport errors from `send` are returned as is.
    pub async fn execute<F, Fut>(&self, route: &Route, mut send: F) -> Result<RestResponse, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RestResponse, Error>>,
    {
        let bucket = self.bucket(route);
        let _turn = bucket.turn.lock().await;
        let mut throttled = 0u32;

        loop {
            self.wait_global().await;

            let blocked_until = bucket.state.lock().blocked_until(Instant::now());
            if let Some(until) = blocked_until {
                debug!(
                    "{} exhausted, waiting {:?}",
                    route.bucket_key(),
                    until.saturating_duration_since(Instant::now())
                );
                sleep_until(until).await;
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_rest_request();
            }
            let response = send().await?;

            let headers = RateLimitHeaders::parse(&response.headers);
            bucket.state.lock().update(&headers, Instant::now());

            if !response.is_throttled() {
                return Ok(response);
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_rest_rate_limited();
            }

            let body: Option<ThrottleBody> = serde_json::from_str(&response.body).ok();
            let retry_after = body
                .as_ref()
                .and_then(|b| b.retry_after)
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
                .or(headers.retry_after)
                .or(headers.reset_after)
                .unwrap_or(FALLBACK_RETRY_AFTER);
            let global = headers.global || body.map(|b| b.global).unwrap_or(false);

            throttled += 1;
            if throttled > self.max_throttle_retries {
                return Err(Error::RateLimited {
                    route: route.bucket_key(),
                    retry_after,
                });
            }

            let retry_at = Instant::now() + retry_after;
            if global {
                warn!("Global rate limit hit on {}, retrying in {:?}", route, retry_after);
                let mut global_until = self.global_until.lock();
                if global_until.map_or(true, |until| until < retry_at) {
                    *global_until = Some(retry_at);
                }
            } else {
                warn!("Rate limited on {}, retrying in {:?}", route, retry_after);
                let mut state = bucket.state.lock();
                state.remaining = Some(0);
                state.reset_at = Some(retry_at);
            }

            sleep(retry_after).await;
        }
    }
}
