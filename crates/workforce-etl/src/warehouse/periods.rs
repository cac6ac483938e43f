use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use super::store::{PeriodStore, StoreError};

/// Identifier of a billing period; also the `fact_shift` partition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodId(pub i64);

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub period_id: PeriodId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl BillingPeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeriodError {
    #[error("no billing period covers {date}")]
    PeriodNotFound { date: NaiveDate },
    #[error("unknown billing period {period_id}")]
    UnknownPeriod { period_id: PeriodId },
    #[error("billing period {period_id} starts {start} after it ends {end}")]
    InvalidRange {
        period_id: PeriodId,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("billing periods {first} and {second} overlap")]
    OverlappingPeriods { first: PeriodId, second: PeriodId },
    #[error("billing period {0} is defined more than once")]
    DuplicatePeriod(PeriodId),
    #[error("billing calendar does not cover {start}..{end}: first gap at {gap}")]
    NotCovered {
        start: NaiveDate,
        end: NaiveDate,
        gap: NaiveDate,
    },
    #[error("cannot generate periods: {0}")]
    InvalidGeneration(String),
    #[error("line {line}: invalid date '{value}'")]
    InvalidDate { line: u64, value: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct PeriodCsvRow {
    period_id: i64,
    start_date: String,
    end_date: String,
}

/// Maps dates onto non-overlapping billing periods.
#[derive(Debug, Clone, Default)]
pub struct BillingPeriodResolver {
    periods: Vec<BillingPeriod>,
}

impl BillingPeriodResolver {
    pub fn new(mut periods: Vec<BillingPeriod>) -> Result<Self, PeriodError> {
        for period in &periods {
            if period.start_date > period.end_date {
                return Err(PeriodError::InvalidRange {
                    period_id: period.period_id,
                    start: period.start_date,
                    end: period.end_date,
                });
            }
        }

        let mut ids: Vec<PeriodId> = periods.iter().map(|period| period.period_id).collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PeriodError::DuplicatePeriod(pair[0]));
        }

        periods.sort_by_key(|period| period.start_date);
        if let Some(pair) = periods
            .windows(2)
            .find(|pair| pair[1].start_date <= pair[0].end_date)
        {
            return Err(PeriodError::OverlappingPeriods {
                first: pair[0].period_id,
                second: pair[1].period_id,
            });
        }

        Ok(Self { periods })
    }

    pub fn from_store(store: &(impl PeriodStore + ?Sized)) -> Result<Self, PeriodError> {
        Self::new(store.load_periods()?)
    }

    pub fn periods(&self) -> &[BillingPeriod] {
        &self.periods
    }

    pub fn resolve(&self, date: NaiveDate) -> Result<PeriodId, PeriodError> {
        self.find(date)
            .map(|period| period.period_id)
            .ok_or(PeriodError::PeriodNotFound { date })
    }

    pub fn period_bounds(&self, period_id: PeriodId) -> Result<(NaiveDate, NaiveDate), PeriodError> {
        self.periods
            .iter()
            .find(|period| period.period_id == period_id)
            .map(|period| (period.start_date, period.end_date))
            .ok_or(PeriodError::UnknownPeriod { period_id })
    }

    /// Fails unless every day of `[start, end]` falls in some period.
    pub fn ensure_covers(&self, start: NaiveDate, end: NaiveDate) -> Result<(), PeriodError> {
        let mut cursor = start;
        while cursor <= end {
            let period = self.find(cursor).ok_or(PeriodError::NotCovered {
                start,
                end,
                gap: cursor,
            })?;
            match period.end_date.succ_opt() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(())
    }

    fn find(&self, date: NaiveDate) -> Option<&BillingPeriod> {
        let index = self
            .periods
            .partition_point(|period| period.start_date <= date);
        index
            .checked_sub(1)
            .map(|last| &self.periods[last])
            .filter(|period| period.contains(date))
    }
}

/// Reads `period_id,start_date,end_date` rows.
pub fn parse_csv<R: Read>(reader: R) -> Result<Vec<BillingPeriod>, PeriodError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut periods = Vec::new();
    for result in csv_reader.deserialize::<PeriodCsvRow>() {
        let row = result?;
        let line = periods.len() as u64 + 2;
        periods.push(BillingPeriod {
            period_id: PeriodId(row.period_id),
            start_date: parse_date(&row.start_date, line)?,
            end_date: parse_date(&row.end_date, line)?,
        });
    }
    Ok(periods)
}

pub fn from_csv_path(path: &Path) -> Result<Vec<BillingPeriod>, PeriodError> {
    let file = File::open(path).map_err(|source| PeriodError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_csv(file)
}

/// Upper bound on one `generate` call; a decade of weekly periods fits well under it.
pub const MAX_GENERATED_PERIODS: u32 = 5_000;

/// `count` back-to-back periods of `length_days` starting at `anchor`. Each id is
/// the period's start date written as `YYYYMMDD`.
pub fn generate(
    anchor: NaiveDate,
    length_days: u32,
    count: u32,
) -> Result<Vec<BillingPeriod>, PeriodError> {
    if length_days == 0 {
        return Err(PeriodError::InvalidGeneration(
            "period length must be at least one day".to_string(),
        ));
    }
    if count > MAX_GENERATED_PERIODS {
        return Err(PeriodError::InvalidGeneration(format!(
            "at most {MAX_GENERATED_PERIODS} periods can be generated at once, got {count}"
        )));
    }
    let out_of_range = || {
        PeriodError::InvalidGeneration(format!(
            "{count} periods of {length_days} days from {anchor} run past the last representable date"
        ))
    };

    let length = Days::new(u64::from(length_days));
    let mut periods = Vec::with_capacity(count as usize);
    let mut start = anchor;
    for _ in 0..count {
        let next = start.checked_add_days(length).ok_or_else(out_of_range)?;
        let end = next.pred_opt().ok_or_else(out_of_range)?;
        periods.push(BillingPeriod {
            period_id: PeriodId(date_key(start)),
            start_date: start,
            end_date: end,
        });
        start = next;
    }
    Ok(periods)
}

fn date_key(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

fn parse_date(value: &str, line: u64) -> Result<NaiveDate, PeriodError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%m/%d/%Y"))
        .map_err(|_| PeriodError::InvalidDate {
            line,
            value: value.to_string(),
        })
}
