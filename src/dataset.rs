//! Derives which datasets an ERP import should fetch, and from which date, for a project.
//!
//! Project ids encode their reporting period: `m<MM><YY>` for monthly reports,
//! `q<Q><YY>` for quarterly reports and `ar<YY>` for annual reports, each optionally
//! followed by a `-N` variant suffix. Years are always read as `20<YY>`.

use chrono::{Datelike, Months, NaiveDate};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::DatasetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Monthly,
    Quarterly,
    Annual,
}

impl ReportKind {
    pub fn from_report_type(report_type: &str) -> Result<Self, DatasetError> {
        if report_type.contains("annual-report") {
            Ok(ReportKind::Annual)
        } else if report_type.contains("monthly") {
            Ok(ReportKind::Monthly)
        } else if report_type.contains("quarterly") {
            Ok(ReportKind::Quarterly)
        } else {
            Err(DatasetError::UnsupportedReportType(report_type.to_string()))
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Monthly => write!(f, "monthly"),
            ReportKind::Quarterly => write!(f, "quarterly"),
            ReportKind::Annual => write!(f, "annual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPeriod {
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year { year: i32 },
}

impl ReportPeriod {
    pub fn year(&self) -> i32 {
        match *self {
            ReportPeriod::Month { year, .. }
            | ReportPeriod::Quarter { year, .. }
            | ReportPeriod::Year { year } => year,
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self, ReportPeriod::Month { .. })
    }

    /// The same period shape, moved to another year.
    pub fn with_year(&self, year: i32) -> ReportPeriod {
        match *self {
            ReportPeriod::Month { month, .. } => ReportPeriod::Month { year, month },
            ReportPeriod::Quarter { quarter, .. } => ReportPeriod::Quarter { year, quarter },
            ReportPeriod::Year { .. } => ReportPeriod::Year { year },
        }
    }
}

/// Closing dates of reporting periods.
pub trait ReportingCalendar: Send + Sync {
    fn period_end(&self, period: ReportPeriod) -> Option<NaiveDate>;
}

/// Fiscal year equal to the calendar year.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarYear;

impl ReportingCalendar for CalendarYear {
    fn period_end(&self, period: ReportPeriod) -> Option<NaiveDate> {
        match period {
            ReportPeriod::Month { year, month } => last_day_of_month(year, month),
            ReportPeriod::Quarter { year, quarter } => last_day_of_month(year, quarter * 3),
            ReportPeriod::Year { year } => NaiveDate::from_ymd_opt(year, 12, 31),
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)?
        .checked_add_months(Months::new(1))?
        .pred_opt()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportWindow {
    pub period: ReportPeriod,
    pub dataset_pattern: String,
    pub start_date: NaiveDate,
}

pub fn import_window(
    report_type: &str,
    project_id: &str,
    today: NaiveDate,
    calendar: &dyn ReportingCalendar,
) -> Result<ImportWindow, DatasetError> {
    let kind = ReportKind::from_report_type(report_type)?;
    let period = parse_project_id(kind, project_id)?;
    Ok(ImportWindow {
        period,
        dataset_pattern: dataset_pattern(&period),
        start_date: start_date(&period, today, calendar)?,
    })
}

fn monthly_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^m(\d{2})(\d{2})(-\d+)?$").expect("valid monthly pattern"))
}

fn quarterly_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^q(\d)(\d{2})(-\d+)?$").expect("valid quarterly pattern"))
}

fn annual_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ar(\d{2})(-\d+)?$").expect("valid annual pattern"))
}

pub fn parse_project_id(kind: ReportKind, project_id: &str) -> Result<ReportPeriod, DatasetError> {
    let unparseable = || DatasetError::UnparseableProjectId {
        project_id: project_id.to_string(),
        report_type: kind.to_string(),
    };
    let number = |digits: &str| digits.parse::<u32>().map_err(|_| unparseable());
    let year = |yy: &str| format!("20{yy}").parse::<i32>().map_err(|_| unparseable());

    let period = match kind {
        ReportKind::Monthly => {
            let caps = monthly_pattern().captures(project_id).ok_or_else(unparseable)?;
            ReportPeriod::Month {
                year: year(&caps[2])?,
                month: number(&caps[1])?,
            }
        }
        ReportKind::Quarterly => {
            let caps = quarterly_pattern().captures(project_id).ok_or_else(unparseable)?;
            ReportPeriod::Quarter {
                year: year(&caps[2])?,
                quarter: number(&caps[1])?,
            }
        }
        ReportKind::Annual => {
            let caps = annual_pattern().captures(project_id).ok_or_else(unparseable)?;
            ReportPeriod::Year {
                year: year(&caps[1])?,
            }
        }
    };

    match period {
        ReportPeriod::Month { month, .. } if !(1..=12).contains(&month) => Err(
            DatasetError::InvalidPeriod(format!("month {month} in '{project_id}'")),
        ),
        ReportPeriod::Quarter { quarter, .. } if !(1..=4).contains(&quarter) => Err(
            DatasetError::InvalidPeriod(format!("quarter {quarter} in '{project_id}'")),
        ),
        _ => Ok(period),
    }
}

/// Filter string naming the datasets of the period, e.g. `* Q2 2024`.
pub fn dataset_pattern(period: &ReportPeriod) -> String {
    let label = match *period {
        ReportPeriod::Month { month, .. } => match month {
            3 => "Q1".to_string(),
            6 => "Q2".to_string(),
            9 => "Q3".to_string(),
            12 => "AR".to_string(),
            other => format!("M{other}"),
        },
        ReportPeriod::Quarter { quarter: 4, .. } => "AR".to_string(),
        ReportPeriod::Quarter { quarter, .. } => format!("Q{quarter}"),
        ReportPeriod::Year { .. } => "AR".to_string(),
    };
    format!("* {label} {}", period.year())
}

/// First day of the window the import service should (re)load data from.
///
/// In January and February a non-monthly report is anchored on last year's closing date, since
/// the previous year is still being closed.
pub fn start_date(
    period: &ReportPeriod,
    today: NaiveDate,
    calendar: &dyn ReportingCalendar,
) -> Result<NaiveDate, DatasetError> {
    let period_end = |period: ReportPeriod| {
        calendar
            .period_end(period)
            .ok_or_else(|| DatasetError::InvalidPeriod(format!("no closing date for {period:?}")))
    };

    let early_in_year = today.month() <= 2;

    if period.is_monthly() {
        return months_back_to_first(period_end(*period)?, 1);
    }

    let reference_end = if early_in_year {
        period_end(period.with_year(today.year() - 1))?
    } else {
        period_end(*period)?
    };

    if today > reference_end {
        months_back_to_first(reference_end, if early_in_year { 0 } else { 2 })
    } else {
        months_back_to_first(today, 2)
    }
}

fn months_back_to_first(date: NaiveDate, months: u32) -> Result<NaiveDate, DatasetError> {
    date.checked_sub_months(Months::new(months))
        .and_then(|d| d.with_day(1))
        .ok_or_else(|| DatasetError::InvalidPeriod(format!("{date} minus {months} months")))
}
