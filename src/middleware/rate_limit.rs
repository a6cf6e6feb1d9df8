//! Fixed-window rate limiting keyed by client IP.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ApiConfig;
use crate::error::{ApiError, AppError};

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later.";

/// Windows are pruned once the table grows past this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of one hit, used for the `RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    pub allowed: bool,
}

#[derive(Clone)]
pub struct RateLimit {
    limit: u32,
    window: Duration,
    clients: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

impl RateLimit {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.rate_limit_requests, Duration::from_secs(config.rate_limit_window_secs))
    }

    /// Count a request from `ip` at `now`.
    pub async fn hit(&self, ip: IpAddr, now: Instant) -> RateLimitResult {
        let mut clients = self.clients.lock().await;
        if clients.len() > PRUNE_THRESHOLD {
            let window = self.window;
            clients.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = clients.entry(ip).or_insert(Window { started: now, count: 0 });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window { started: now, count: 0 };
        }
        entry.count = entry.count.saturating_add(1);

        let elapsed = now.duration_since(entry.started);
        RateLimitResult {
            limit: self.limit,
            remaining: self.limit.saturating_sub(entry.count),
            reset_secs: self.window.saturating_sub(elapsed).as_secs(),
            allowed: entry.count <= self.limit,
        }
    }

    pub async fn middleware(State(rate_limit): State<Self>, request: Request, next: Next) -> Response {
        let ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let result = rate_limit.hit(ip, Instant::now()).await;
        let mut response = if result.allowed {
            next.run(request).await
        } else {
            warn!("Rate limit exceeded for {}", ip);
            ApiError::from(AppError::new(RATE_LIMIT_MESSAGE, 429)).into_response()
        };
        add_rate_limit_headers(&mut response, &result);
        response
    }
}

fn add_rate_limit_headers(response: &mut Response, result: &RateLimitResult) {
    let headers = response.headers_mut();
    let values = [
        ("ratelimit-limit", result.limit as u64),
        ("ratelimit-remaining", result.remaining as u64),
        ("ratelimit-reset", result.reset_secs),
    ];
    for (name, value) in values {
        if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), v);
        }
    }
}
