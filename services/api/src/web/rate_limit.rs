//! services/api/src/web/rate_limit.rs
//!
//! Per-client rate limiting using a keyed GCRA limiter.
//!
//! Each client IP gets a bucket of `capacity` requests that refills fully over
//! `refill`. Buckets are created on first use; idle ones are pruned when the
//! tracked key count reaches the configured maximum and on a periodic sweep.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::web::state::AppState;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Outcome of a denied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied {
    pub retry_after: Duration,
}

pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    max_clients: usize,
}

impl ClientRateLimiter {
    /// `capacity` requests per client, refilled completely over `refill`.
    pub fn new(capacity: u32, refill: Duration, max_clients: usize) -> Self {
        let burst = NonZeroU32::new(capacity.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = (refill / burst.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            max_clients: max_clients.max(1),
        }
    }

    /// Takes one token from the client's bucket.
    pub fn admit(&self, client: IpAddr) -> Result<(), Denied> {
        if self.limiter.len() >= self.max_clients {
            self.prune();
        }
        self.limiter.check_key(&client).map_err(|not_until| Denied {
            retry_after: not_until.wait_time_from(self.clock.now()),
        })
    }

    /// Drops buckets that have refilled completely.
    pub fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(before, after = self.limiter.len(), "Pruned idle rate limit buckets");
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

/// Prunes idle buckets every `interval` until `shutdown` fires.
pub async fn run_pruner(limiter: Arc<ClientRateLimiter>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => limiter.prune(),
        }
    }
}

#[derive(Serialize)]
struct RateLimitedBody {
    code: &'static str,
    message: String,
}

/// Middleware that rejects requests from clients that exhausted their bucket.
///
/// The key is the socket peer address; forwarded headers are not trusted.
pub async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match state.rate_limiter.admit(client) {
        Ok(()) => next.run(req).await,
        Err(denied) => {
            warn!(%client, "Rate limit exceeded");
            rate_limited_response(denied)
        }
    }
}

fn rate_limited_response(denied: Denied) -> Response {
    let retry_secs = denied.retry_after.as_secs() + u64::from(denied.retry_after.subsec_nanos() > 0);
    let body = RateLimitedBody {
        code: "RATE_LIMITED",
        message: "Too many requests, slow down".to_string(),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_secs.max(1).to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn one_request_over_capacity_is_rejected() {
        let limiter = ClientRateLimiter::new(5, Duration::from_secs(60), 100);
        let results: Vec<bool> = (0..6).map(|_| limiter.admit(ip(1)).is_ok()).collect();
        assert_eq!(results, vec![true, true, true, true, true, false]);
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(60), 100);
        assert!(limiter.admit(ip(1)).is_ok());
        assert!(limiter.admit(ip(1)).is_err());
        assert!(limiter.admit(ip(2)).is_ok());
    }

    #[test]
    fn denial_reports_when_to_retry() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(60), 100);
        limiter.admit(ip(1)).unwrap();
        let denied = limiter.admit(ip(1)).unwrap_err();
        assert!(denied.retry_after > Duration::from_secs(50));
        assert!(denied.retry_after <= Duration::from_secs(60));

        let response = rate_limited_response(denied);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn capacity_is_restored_after_a_full_refill() {
        let limiter = ClientRateLimiter::new(2, Duration::from_millis(100), 100);
        assert!(limiter.admit(ip(1)).is_ok());
        assert!(limiter.admit(ip(1)).is_ok());
        assert!(limiter.admit(ip(1)).is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.admit(ip(1)).is_ok());
        assert!(limiter.admit(ip(1)).is_ok());
    }

    #[tokio::test]
    async fn idle_buckets_are_pruned_once_the_key_limit_is_reached() {
        let limiter = ClientRateLimiter::new(1, Duration::from_millis(20), 3);
        for last in 1..=3 {
            limiter.admit(ip(last)).unwrap();
        }
        assert_eq!(limiter.tracked_clients(), 3);

        tokio::time::sleep(Duration::from_millis(80)).await;
        limiter.admit(ip(9)).unwrap();
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
