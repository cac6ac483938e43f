use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;

use super::auth::{Credentials, TokenCache, TokenResponse};
use super::query::QueryParams;
use super::rate_limit::RateLimiter;
use super::retry::{parse_retry_after, Attempt, RetryFailure, RetryPolicy};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use super::{ApiError, RecordSource};
use crate::clock::Clock;
use crate::config::ApiConfig;
use crate::transform::Record;

const MAX_QUOTA_PAUSE: Duration = Duration::from_secs(60);
const MAX_PAGES: u32 = 10_000;
// Reset headers above this are unix timestamps rather than a countdown.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// One page of a list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<Record>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    count: Option<u64>,
}

pub struct ApiClient<T: HttpTransport> {
    transport: T,
    base_url: String,
    token_url: String,
    credentials: Credentials,
    page_size: u32,
    quota_floor: u32,
    retry: RetryPolicy,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    tokens: Mutex<TokenCache>,
    quota_pause: Mutex<Option<Duration>>,
}

impl ApiClient<ReqwestTransport> {
    pub fn from_config(config: &ApiConfig, clock: Arc<dyn Clock>) -> Result<Self, ApiError> {
        let transport =
            ReqwestTransport::new(config.request_timeout).map_err(|source| ApiError::Transport {
                endpoint: config.base_url.clone(),
                source,
            })?;
        Ok(Self::new(transport, config, clock))
    }
}

impl<T: HttpTransport> ApiClient<T> {
    pub fn new(transport: T, config: &ApiConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url(),
            credentials: Credentials {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            },
            page_size: config.page_size.max(1),
            quota_floor: config.quota_floor,
            retry: RetryPolicy::new(config.max_retries, config.retry_delay),
            limiter: RateLimiter::per_minute(config.calls_per_minute, clock.clone()),
            tokens: Mutex::new(TokenCache::new(config.token_refresh_buffer)),
            quota_pause: Mutex::new(None),
            clock,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Requests a fresh token with the password grant and caches it.
    pub fn authenticate(&self) -> Result<(), ApiError> {
        self.request_token().map(|_| ())
    }

    fn request_token(&self) -> Result<String, ApiError> {
        let request = HttpRequest::post_form(self.token_url.clone(), self.credentials.grant_form());
        let response = self
            .execute("token", &request)
            .map_err(|err| ApiError::Authentication {
                reason: err.to_string(),
            })?;
        let token: TokenResponse =
            response
                .decode()
                .map_err(|source| ApiError::Authentication {
                    reason: format!("token response could not be read: {source}"),
                })?;
        if token.access_token.is_empty() {
            return Err(ApiError::Authentication {
                reason: "token response carried an empty access_token".to_string(),
            });
        }

        let now = self.clock.now();
        let value = self.lock_tokens().store(token, now);
        tracing::info!(username = %self.credentials.username, "obtained api access token");
        Ok(value)
    }

    fn access_token(&self) -> Result<String, ApiError> {
        let cached = self
            .lock_tokens()
            .current(self.clock.now())
            .map(str::to_string);
        match cached {
            Some(token) => Ok(token),
            None => self.request_token(),
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, TokenCache> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches one page. A rejected token is refreshed once before giving up.
    pub fn fetch_page(
        &self,
        endpoint: &str,
        params: &QueryParams,
        offset: u64,
        limit: u32,
    ) -> Result<Page, ApiError> {
        let token = self.access_token()?;
        match self.get_page(&token, endpoint, params, offset, limit) {
            Err(ApiError::Status { status: 401, .. }) => {
                tracing::info!(endpoint, "access token rejected, re-authenticating");
                self.lock_tokens().invalidate();
                let token = self.request_token()?;
                match self.get_page(&token, endpoint, params, offset, limit) {
                    Err(ApiError::Status { status: 401, .. }) => Err(ApiError::Authentication {
                        reason: format!("{endpoint} rejected a freshly issued token"),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn get_page(
        &self,
        token: &str,
        endpoint: &str,
        params: &QueryParams,
        offset: u64,
        limit: u32,
    ) -> Result<Page, ApiError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let request = HttpRequest::get(url)
            .with_query(params.with_page(offset, limit))
            .with_bearer(token);
        let response = self.execute(endpoint, &request)?;
        let envelope: Envelope = response.decode().map_err(|source| ApiError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Page {
            records: envelope.data,
            total_count: envelope.meta.and_then(|meta| meta.count),
        })
    }

    /// Walks `endpoint` page by page until an empty page, a short page, or the
    /// advertised total is reached. A full page identical to the one before it
    /// means the server ignores `offset`, and is an error.
    pub fn fetch_all(&self, endpoint: &str, params: &QueryParams) -> Result<Vec<Record>, ApiError> {
        let limit = self.page_size;
        let mut records = Vec::new();
        let mut offset = 0u64;
        let mut pages = 0u32;
        let mut previous: Option<Vec<Record>> = None;

        loop {
            if pages >= MAX_PAGES {
                return Err(ApiError::Pagination {
                    endpoint: endpoint.to_string(),
                    reason: format!("still receiving full pages after {MAX_PAGES} requests"),
                });
            }
            let page = self.fetch_page(endpoint, params, offset, limit)?;
            pages += 1;
            let received = page.records.len();
            if received == 0 {
                break;
            }
            if previous.as_ref() == Some(&page.records) {
                return Err(ApiError::Pagination {
                    endpoint: endpoint.to_string(),
                    reason: format!("page at offset {offset} repeats the previous page"),
                });
            }
            records.extend(page.records.iter().cloned());
            previous = Some(page.records);

            let total_reached = page
                .total_count
                .is_some_and(|total| records.len() as u64 >= total);
            if total_reached || received < limit as usize {
                break;
            }
            offset += u64::from(limit);
        }

        tracing::debug!(endpoint, pages, records = records.len(), "fetched endpoint");
        Ok(records)
    }

    fn execute(&self, endpoint: &str, request: &HttpRequest) -> Result<HttpResponse, ApiError> {
        self.retry
            .run(self.clock.as_ref(), |_| self.attempt(endpoint, request))
            .map_err(|failure| match failure {
                RetryFailure::Exhausted { attempts, last } => ApiError::RetriesExhausted {
                    endpoint: endpoint.to_string(),
                    attempts,
                    last: Box::new(last),
                },
                RetryFailure::Aborted(err) => err,
            })
    }

    fn attempt(
        &self,
        endpoint: &str,
        request: &HttpRequest,
    ) -> Result<HttpResponse, Attempt<ApiError>> {
        self.honour_quota_pause();
        self.limiter.wait_if_needed();

        let response = match self.transport.send(request) {
            Ok(response) => response,
            Err(source) => {
                let transient = source.is_transient();
                let error = ApiError::Transport {
                    endpoint: endpoint.to_string(),
                    source,
                };
                return if transient {
                    self.limiter.record_error();
                    Err(Attempt::Retry { error, after: None })
                } else {
                    Err(Attempt::Abort(error))
                };
            }
        };

        self.note_quota(&response);
        if response.is_success() {
            self.limiter.record_success();
            return Ok(response);
        }

        let status = response.status;
        let retry_after = response
            .header("retry-after")
            .and_then(|value| parse_retry_after(value, self.clock.utc_now()));
        let error = ApiError::Status {
            endpoint: endpoint.to_string(),
            status,
            body: response.body,
        };
        if RetryPolicy::is_retryable_status(status) {
            self.limiter.record_error();
            Err(Attempt::Retry {
                error,
                after: retry_after,
            })
        } else {
            Err(Attempt::Abort(error))
        }
    }

    fn note_quota(&self, response: &HttpResponse) {
        let Some(remaining) = response
            .header("x-ratelimit-remaining")
            .and_then(|value| value.trim().parse::<u64>().ok())
        else {
            return;
        };
        if remaining > u64::from(self.quota_floor) {
            return;
        }

        let pause = response
            .header("x-ratelimit-reset")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|reset| {
                if reset >= EPOCH_THRESHOLD {
                    let now = self.clock.utc_now().timestamp().max(0) as u64;
                    Duration::from_secs(reset.saturating_sub(now))
                } else {
                    Duration::from_secs(reset)
                }
            })
            .unwrap_or(self.retry.base_delay)
            .min(MAX_QUOTA_PAUSE);

        tracing::info!(
            remaining,
            pause_ms = pause.as_millis() as u64,
            "api quota nearly spent, pausing before next call"
        );
        *self
            .quota_pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pause);
    }

    fn honour_quota_pause(&self) {
        let pending = self
            .quota_pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pause) = pending {
            self.clock.sleep(pause);
        }
    }
}

impl<T: HttpTransport> RecordSource for ApiClient<T> {
    fn authenticate(&self) -> Result<(), ApiError> {
        ApiClient::authenticate(self)
    }

    fn fetch_all(&self, endpoint: &str, params: &QueryParams) -> Result<Vec<Record>, ApiError> {
        ApiClient::fetch_all(self, endpoint, params)
    }
}

impl<T: HttpTransport> std::fmt::Debug for ApiClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("page_size", &self.page_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransportError;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::VecDeque;

    struct Scripted {
        responses: Mutex<VecDeque<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpTransport for Scripted {
        fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted response available"))
        }
    }

    fn config() -> ApiConfig {
        ApiConfig {
            base_url: "https://wfm.test/api".into(),
            token_path: "/oauth/token".into(),
            client_id: "etl".into(),
            client_secret: "secret".into(),
            username: "loader".into(),
            password: "pw".into(),
            page_size: 2,
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            calls_per_minute: 100,
            token_refresh_buffer: Duration::from_secs(60),
            quota_floor: 5,
        }
    }

    fn token() -> HttpResponse {
        HttpResponse::json(200, &json!({"access_token": "t1", "expires_in": 3600}))
    }

    #[test]
    fn quota_floor_triggers_a_pause_before_the_next_call() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let transport = Scripted::new(vec![
            token(),
            HttpResponse::json(200, &json!({"data": [{"id": 1}, {"id": 2}], "meta": {"count": 3}}))
                .with_header("X-RateLimit-Remaining", "2")
                .with_header("X-RateLimit-Reset", "9"),
            HttpResponse::json(200, &json!({"data": [{"id": 3}], "meta": {"count": 3}})),
        ]);
        let client = ApiClient::new(transport, &config(), clock.clone());

        let records = client
            .fetch_all("employees", &QueryParams::new())
            .expect("fetch succeeds");

        assert_eq!(records.len(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(9)]);
    }

    #[test]
    fn token_endpoint_rejection_is_an_authentication_error() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let transport = Scripted::new(vec![HttpResponse::json(
            400,
            &json!({"error": "invalid_grant"}),
        )]);
        let client = ApiClient::new(transport, &config(), clock);

        match client.authenticate() {
            Err(ApiError::Authentication { reason }) => assert!(reason.contains("400")),
            other => panic!("expected authentication error, got {other:?}"),
        }
    }

    #[test]
    fn cached_token_is_reused_until_the_refresh_buffer() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let empty = || HttpResponse::json(200, &json!({"data": [], "meta": {"count": 0}}));
        let transport = Scripted::new(vec![
            HttpResponse::json(200, &json!({"access_token": "t1", "expires_in": 600})),
            empty(),
            empty(),
            HttpResponse::json(200, &json!({"access_token": "t2", "expires_in": 600})),
            empty(),
        ]);
        let client = ApiClient::new(transport, &config(), clock.clone());

        client.fetch_all("clients", &QueryParams::new()).expect("first");
        clock.advance(Duration::from_secs(300));
        client.fetch_all("clients", &QueryParams::new()).expect("second");
        clock.advance(Duration::from_secs(250));
        client.fetch_all("clients", &QueryParams::new()).expect("third");

        let seen = client.transport().seen.lock().unwrap();
        let bearers: Vec<_> = seen.iter().map(|request| request.bearer.clone()).collect();
        assert_eq!(
            bearers,
            vec![
                None,
                Some("t1".to_string()),
                Some("t1".to_string()),
                None,
                Some("t2".to_string())
            ]
        );
    }
}
