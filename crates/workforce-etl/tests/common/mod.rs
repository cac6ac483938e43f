#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use workforce_etl::api::{
    ApiError, HttpRequest, HttpResponse, HttpTransport, QueryParams, RecordSource, TransportError,
};
use workforce_etl::clock::ManualClock;
use workforce_etl::config::ApiConfig;
use workforce_etl::transform::{parse_timestamp, Record};
use workforce_etl::warehouse::periods::generate;
use workforce_etl::warehouse::{BillingPeriod, MemoryWarehouse};

pub fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 2, 1, 6, 0, 0).unwrap(),
    ))
}

pub fn records(values: Vec<Value>) -> Vec<Record> {
    values
        .into_iter()
        .map(|value| value.as_object().cloned().expect("object record"))
        .collect()
}

/// Two-week periods from 2024-12-30 through 2025-03-09.
pub fn biweekly_periods() -> Vec<BillingPeriod> {
    generate(date("2024-12-30"), 14, 5).expect("periods")
}

pub fn warehouse() -> Arc<MemoryWarehouse> {
    Arc::new(MemoryWarehouse::with_periods(&biweekly_periods()))
}

pub fn api_config(page_size: u32) -> ApiConfig {
    ApiConfig {
        base_url: "https://wfm.test/api".into(),
        token_path: "/oauth/token".into(),
        client_id: "etl".into(),
        client_secret: "secret".into(),
        username: "loader".into(),
        password: "pw".into(),
        page_size,
        max_retries: 3,
        retry_delay: Duration::from_millis(500),
        request_timeout: Duration::from_secs(5),
        calls_per_minute: 1000,
        token_refresh_buffer: Duration::from_secs(60),
        quota_floor: 5,
    }
}

pub fn token(access_token: &str) -> HttpResponse {
    HttpResponse::json(
        200,
        &json!({"access_token": access_token, "expires_in": 3600, "token_type": "bearer"}),
    )
}

pub fn page(data: Vec<Value>, count: u64) -> HttpResponse {
    HttpResponse::json(200, &json!({"data": data, "meta": {"count": count}}))
}

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<HttpResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn data_requests(&self) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| !request.url.ends_with("/oauth/token"))
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl HttpTransport for ScriptedTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("a scripted response for every request")
    }
}

#[derive(Default)]
struct FakeState {
    data: BTreeMap<String, Vec<Record>>,
    reject_credentials: bool,
    failing: BTreeSet<(String, String)>,
    expired_token: BTreeSet<String>,
    calls: Vec<(String, Vec<(String, String)>)>,
}

/// In-process record source that filters like the real API: equality on plain
/// filters and an inclusive date range on `field:between`.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, endpoint: &str, values: Vec<Value>) -> Self {
        self.state
            .lock()
            .unwrap()
            .data
            .entry(endpoint.to_string())
            .or_default()
            .extend(records(values));
        self
    }

    pub fn reject_credentials(&self) {
        self.state.lock().unwrap().reject_credentials = true;
    }

    /// Makes `endpoint` return a server error for one region.
    pub fn fail(&self, endpoint: &str, region_id: i64) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert((endpoint.to_string(), region_id.to_string()));
    }

    /// Makes `endpoint` fail as if a refreshed token had been rejected.
    pub fn expire_token_on(&self, endpoint: &str) {
        self.state
            .lock()
            .unwrap()
            .expired_token
            .insert(endpoint.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.expired_token.clear();
    }

    pub fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }
}

fn matches(record: &Record, key: &str, expected: &str) -> bool {
    if let Some(field) = key.strip_suffix(":between") {
        let Some((start, end)) = expected.split_once('|') else {
            return false;
        };
        let day = record
            .get(field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .map(|at| at.date_naive());
        return match day {
            Some(day) => day >= date(start) && day <= date(end),
            None => true,
        };
    }
    match record.get(key) {
        Some(Value::String(text)) => text == expected,
        Some(Value::Number(number)) => number.to_string() == expected,
        _ => false,
    }
}

impl RecordSource for FakeSource {
    fn authenticate(&self) -> Result<(), ApiError> {
        if self.state.lock().unwrap().reject_credentials {
            return Err(ApiError::Authentication {
                reason: "token returned status 401".to_string(),
            });
        }
        Ok(())
    }

    fn fetch_all(&self, endpoint: &str, params: &QueryParams) -> Result<Vec<Record>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push((endpoint.to_string(), params.pairs().to_vec()));

        if state.expired_token.contains(endpoint) {
            return Err(ApiError::Authentication {
                reason: format!("{endpoint} rejected a freshly issued token"),
            });
        }
        let region = params
            .pairs()
            .iter()
            .find(|(key, _)| key == "region_id")
            .map(|(_, value)| value.clone());
        if let Some(region) = region {
            if state.failing.contains(&(endpoint.to_string(), region)) {
                return Err(ApiError::Status {
                    endpoint: endpoint.to_string(),
                    status: 500,
                    body: "upstream unavailable".to_string(),
                });
            }
        }

        Ok(state
            .data
            .get(endpoint)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        params
                            .pairs()
                            .iter()
                            .all(|(key, value)| matches(row, key, value))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
