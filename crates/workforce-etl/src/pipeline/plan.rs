use chrono::NaiveDate;
use serde_json::{json, Value};

pub const BATCH_TYPE: &str = "workforce_sync";

/// Parameters of one invocation of the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Restrict the run to these regions; empty means every region.
    pub regions: Vec<i64>,
    /// Overrides the derived run id used for checkpoints.
    pub run_id: Option<String>,
}

impl RunRequest {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            regions: Vec::new(),
            run_id: None,
        }
    }

    pub fn with_regions(mut self, regions: Vec<i64>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Runs over the same range share an id, so a rerun resumes the last one.
    pub fn run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("shifts:{}:{}", self.start, self.end))
    }

    pub fn metadata(&self) -> Value {
        json!({
            "run_id": self.run_id(),
            "start": self.start,
            "end": self.end,
            "regions": self.regions,
        })
    }
}

pub fn partition_key(region_id: i64) -> String {
    format!("region:{region_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_defaults_to_the_date_range() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        let request = RunRequest::new(start, end);
        assert_eq!(request.run_id(), "shifts:2025-01-01:2025-01-31");
        assert_eq!(request.clone().with_run_id("manual").run_id(), "manual");
        assert_eq!(request.metadata()["start"], "2025-01-01");
    }
}
