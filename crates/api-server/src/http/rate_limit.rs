use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use super::AppState;
use super::errors::too_many_requests_response;

type Buckets = HashMap<RateLimitBucketKey, VecDeque<Instant>>;

/// Sliding-window request counter keyed by endpoint and client.
#[derive(Clone, Default)]
pub struct RateLimiter {
    entries: Arc<Mutex<Buckets>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: usize,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
enum LimitedEndpoint {
    ChatQuery,
    SetCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLimitDecision {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateLimitBucketKey {
    endpoint: &'static str,
    subject: String,
}

impl LimitedEndpoint {
    fn from_request(req: &Request) -> Option<Self> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/chat/query") => Some(Self::ChatQuery),
            (&Method::POST, "/config/credential") => Some(Self::SetCredential),
            _ => None,
        }
    }

    fn key_name(self) -> &'static str {
        match self {
            Self::ChatQuery => "chat_query",
            Self::SetCredential => "set_credential",
        }
    }
}

impl RateLimiter {
    /// Periodically drops buckets with no request inside `max_window`.
    pub fn spawn_pruner(
        &self,
        interval: Duration,
        max_window: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.prune(Instant::now(), max_window);
            }
        })
    }

    fn check(
        &self,
        endpoint: LimitedEndpoint,
        subject: &str,
        policy: RateLimitPolicy,
    ) -> RateLimitDecision {
        self.check_at(endpoint, subject, policy, Instant::now())
    }

    fn check_at(
        &self,
        endpoint: LimitedEndpoint,
        subject: &str,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> RateLimitDecision {
        let window = Duration::from_secs(policy.window_seconds);
        let cutoff = now.checked_sub(window).unwrap_or(now);
        let bucket_key = RateLimitBucketKey {
            endpoint: endpoint.key_name(),
            subject: subject.to_string(),
        };

        let mut entries = self.lock_entries();
        let bucket = entries.entry(bucket_key).or_default();
        prune_bucket(bucket, cutoff);

        if bucket.len() >= policy.max_requests {
            let retry_after_seconds = bucket
                .front()
                .map(|first_seen| {
                    let elapsed = now.saturating_duration_since(*first_seen);
                    window.saturating_sub(elapsed).as_secs().max(1)
                })
                .unwrap_or(policy.window_seconds);
            return RateLimitDecision::Denied {
                retry_after_seconds,
            };
        }

        bucket.push_back(now);

        RateLimitDecision::Allowed
    }

    fn prune(&self, now: Instant, max_window: Duration) {
        let global_cutoff = now.checked_sub(max_window).unwrap_or(now);
        self.lock_entries().retain(|_, bucket| {
            prune_bucket(bucket, global_cutoff);
            !bucket.is_empty()
        });
    }

    fn lock_entries(&self) -> MutexGuard<'_, Buckets> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prune_bucket(bucket: &mut VecDeque<Instant>, cutoff: Instant) {
    while let Some(front) = bucket.front() {
        if *front <= cutoff {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

pub(super) async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(endpoint) = LimitedEndpoint::from_request(&req) else {
        return next.run(req).await;
    };

    let subject = request_subject(&req);

    match state
        .rate_limiter
        .check(endpoint, &subject, state.rate_limit_policy)
    {
        RateLimitDecision::Allowed => next.run(req).await,
        RateLimitDecision::Denied {
            retry_after_seconds,
        } => {
            warn!(
                endpoint = endpoint.key_name(),
                subject = %subject,
                retry_after_seconds,
                "request denied by endpoint rate limit",
            );
            too_many_requests_response(retry_after_seconds)
        }
    }
}

/// Peer address of the connection. Forwarding headers are ignored since
/// they are client-controlled.
fn request_subject(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| format!("ip:{}", connect_info.0.ip()))
        .unwrap_or_else(|| "anonymous".to_string())
}
