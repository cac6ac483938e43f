use std::fmt::Display;

use chrono::{Duration, NaiveDate};

/// Filters sent with a list request. Paging parameters are added by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, value: impl Display) -> Self {
        self.pairs.push((field.to_string(), value.to_string()));
        self
    }

    /// `field:between=start|end`, inclusive on both ends.
    pub fn between(mut self, field: &str, start: impl Display, end: impl Display) -> Self {
        self.pairs
            .push((format!("{field}:between"), format!("{start}|{end}")));
        self
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn with_page(&self, offset: u64, limit: u32) -> Vec<(String, String)> {
        let mut pairs = self.pairs.clone();
        pairs.push(("limit".to_string(), limit.to_string()));
        pairs.push(("offset".to_string(), offset.to_string()));
        pairs
    }
}

/// Inclusive date range small enough for one range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn key(&self) -> String {
        format!("{}..{}", self.start, self.end)
    }
}

/// Splits `[start, end]` into consecutive windows of at most `max_days` days.
pub fn date_windows(start: NaiveDate, end: NaiveDate, max_days: u32) -> Vec<DateWindow> {
    let span = Duration::days(i64::from(max_days.max(1)) - 1);
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + span).min(end);
        windows.push(DateWindow {
            start: cursor,
            end: window_end,
        });
        match window_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    windows
}
