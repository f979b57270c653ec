use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::Mutex;

const RATE_WINDOW: Duration = Duration::from_secs(60);

// ── Caller ──────────────────────────────────────────────────────────

/// Identity attached to authenticated requests as a request extension.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Masked key (first 4 chars), safe to log.
    pub key_id: String,
}

// ── ApiKeyConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub enabled: bool,
    pub keys: Arc<HashSet<String>>,
    pub rate_limits: Arc<Mutex<HashMap<String, RateWindow>>>,
    /// 0 disables rate limiting.
    pub limit_per_minute: u64,
}

#[derive(Debug, Clone)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u64,
}

impl ApiKeyConfig {
    pub fn disabled() -> Self {
        Self::from_keys(None, 0)
    }

    /// Builds the config from a comma-separated key list. `None` or an
    /// empty list disables auth.
    pub fn from_keys(raw: Option<&str>, limit_per_minute: u64) -> Self {
        let keys: HashSet<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        let enabled = !keys.is_empty();

        if !enabled {
            tracing::warn!("auth disabled: no API keys configured");
        }

        Self {
            enabled,
            keys: Arc::new(keys),
            rate_limits: Arc::new(Mutex::new(HashMap::new())),
            limit_per_minute,
        }
    }

    /// Returns false once `key` has used up its budget in the current window.
    async fn admit(&self, key: &str) -> bool {
        if self.limit_per_minute == 0 {
            return true;
        }
        let mut guard = self.rate_limits.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });
        if now.duration_since(entry.window_start) >= RATE_WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= self.limit_per_minute {
            return false;
        }
        entry.count += 1;
        true
    }
}

fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}***")
}

// ── Middleware ──────────────────────────────────────────────────────
// Usage: `middleware::from_fn_with_state(app_state, api_key_middleware::<MyAppState>)`

pub async fn api_key_middleware<S>(
    State(state): State<S>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<ApiKeyConfig> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();

    if !auth.enabled {
        req.extensions_mut().insert(Caller {
            key_id: "guest".into(),
        });
        return Ok(next.run(req).await);
    }

    let Some(key) = extract_key(&req) else {
        return Ok(error_response(StatusCode::UNAUTHORIZED, "missing api key"));
    };

    if !auth.keys.contains(&key) {
        return Ok(error_response(StatusCode::FORBIDDEN, "invalid api key"));
    }

    if !auth.admit(&key).await {
        tracing::warn!(key_id=%mask(&key), "rate limit exceeded");
        return Ok(error_response(StatusCode::TOO_MANY_REQUESTS, "rate limited"));
    }

    req.extensions_mut().insert(Caller { key_id: mask(&key) });
    Ok(next.run(req).await)
}

fn extract_key(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

pub fn error_response(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"message": msg}})),
    )
        .into_response()
}
