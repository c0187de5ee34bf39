//! Flight-record cleaning rules and the engine that applies them.
//!
//! Rules are data: each names the column(s) it reads and is skipped when
//! they are absent, so one engine serves every dataset variant. The engine
//! runs an empty-row purge, then the rules grouped by [`Stage`] in a fixed
//! order; later stages see the effects of earlier ones.

use crate::data::extract::TabularExtract;
use crate::data::schema::{Cell, ColumnSchema, ColumnType};
use crate::data::validate::{is_airport_code, is_same_airport, row_is_empty};
use crate::error::TransformError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Column names of the BTS on-time dataset and its known variants.
pub mod columns {
    pub const FL_DATE: &str = "FL_DATE";
    pub const AIRLINE: &str = "AIRLINE";
    pub const ORIGIN: &str = "ORIGIN";
    pub const DEST: &str = "DEST";
    pub const CANCELLED: &str = "CANCELLED";
    pub const DIVERTED: &str = "DIVERTED";
    pub const YEAR: &str = "YEAR";
    pub const MONTH: &str = "MONTH";
    pub const DAY_OF_WEEK: &str = "DAY_OF_WEEK";
    pub const IS_WEEKEND: &str = "IS_WEEKEND";

    /// Delay minutes, including the per-cause breakdown.
    pub const DELAY_MINUTES: &[&str] = &[
        "DEP_DELAY",
        "ARR_DELAY",
        "DEPARTURE_DELAY",
        "ARRIVAL_DELAY",
        "DELAY_DUE_CARRIER",
        "DELAY_DUE_WEATHER",
        "DELAY_DUE_NAS",
        "DELAY_DUE_SECURITY",
        "DELAY_DUE_LATE_AIRCRAFT",
    ];

    pub const DELAY_CAUSES: &[&str] = &[
        "DELAY_DUE_CARRIER",
        "DELAY_DUE_WEATHER",
        "DELAY_DUE_NAS",
        "DELAY_DUE_SECURITY",
        "DELAY_DUE_LATE_AIRCRAFT",
    ];

    pub const FLOAT_METRICS: &[&str] = &[
        "DEP_DELAY",
        "ARR_DELAY",
        "DEPARTURE_DELAY",
        "ARRIVAL_DELAY",
        "TAXI_OUT",
        "TAXI_IN",
        "CRS_ELAPSED_TIME",
        "ELAPSED_TIME",
        "AIR_TIME",
        "DISTANCE",
    ];

    pub const INTEGER_METRICS: &[&str] = &[
        "FL_NUMBER",
        "DOT_CODE",
        "CRS_DEP_TIME",
        "DEP_TIME",
        "WHEELS_OFF",
        "WHEELS_ON",
        "CRS_ARR_TIME",
        "ARR_TIME",
    ];

    pub const DISTANCE: &str = "DISTANCE";
}

/// Accepted date-only layouts for the flight date.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Accepted date-time layouts; the time part is discarded.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];

/// Target kind of a numeric coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    Integer,
    Float,
}

impl NumericKind {
    fn column_type(self) -> ColumnType {
        match self {
            NumericKind::Integer => ColumnType::Integer,
            NumericKind::Float => ColumnType::Float,
        }
    }

    fn zero(self) -> Cell {
        match self {
            NumericKind::Integer => Cell::Int(0),
            NumericKind::Float => Cell::Float(0.0),
        }
    }
}

/// What a coercion does with a value it cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercePolicy {
    /// Unparseable becomes missing; missing stays missing.
    NullOnError,
    /// Unparseable and missing both become zero.
    ZeroFill,
}

/// A calendar field derived from the flight date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    Year,
    Month,
    /// ISO numbering, Monday = 1 through Sunday = 7.
    DayOfWeek,
    IsWeekend,
}

impl DateField {
    fn column_type(self) -> ColumnType {
        match self {
            DateField::IsWeekend => ColumnType::Boolean,
            _ => ColumnType::Integer,
        }
    }

    fn compute(self, date: NaiveDate) -> Cell {
        match self {
            DateField::Year => Cell::Int(i64::from(date.year())),
            DateField::Month => Cell::Int(i64::from(date.month())),
            DateField::DayOfWeek => Cell::Int(i64::from(date.weekday().number_from_monday())),
            DateField::IsWeekend => {
                Cell::Bool(matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
            }
        }
    }
}

/// Execution group of a rule. Groups run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Coerce,
    ParseDate,
    RequireColumns,
    AirportShape,
    NormalizeFlags,
    Round,
    Derive,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::Coerce,
        Stage::ParseDate,
        Stage::RequireColumns,
        Stage::AirportShape,
        Stage::NormalizeFlags,
        Stage::Round,
        Stage::Derive,
    ];
}

/// One cleaning rule. Every rule is a no-op when its column is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    Coerce {
        column: String,
        kind: NumericKind,
        policy: CoercePolicy,
    },
    ParseDate {
        column: String,
    },
    Require {
        column: String,
    },
    AirportCode {
        column: String,
    },
    DistinctRoute {
        origin: String,
        dest: String,
    },
    Flag {
        column: String,
    },
    Round {
        column: String,
        digits: u32,
    },
    Derive {
        column: String,
        source: String,
        field: DateField,
    },
}

impl Rule {
    pub fn stage(&self) -> Stage {
        match self {
            Rule::Coerce { .. } => Stage::Coerce,
            Rule::ParseDate { .. } => Stage::ParseDate,
            Rule::Require { .. } => Stage::RequireColumns,
            Rule::AirportCode { .. } | Rule::DistinctRoute { .. } => Stage::AirportShape,
            Rule::Flag { .. } => Stage::NormalizeFlags,
            Rule::Round { .. } => Stage::Round,
            Rule::Derive { .. } => Stage::Derive,
        }
    }

    fn coerce(column: &str, kind: NumericKind, policy: CoercePolicy) -> Self {
        Rule::Coerce {
            column: column.to_string(),
            kind,
            policy,
        }
    }

    fn derive(column: &str, field: DateField) -> Self {
        Rule::Derive {
            column: column.to_string(),
            source: columns::FL_DATE.to_string(),
            field,
        }
    }
}

/// The rule table for the flight-records dataset.
pub fn flight_rules() -> Vec<Rule> {
    use columns::*;

    let mut rules = Vec::new();
    for col in FLOAT_METRICS {
        rules.push(Rule::coerce(col, NumericKind::Float, CoercePolicy::NullOnError));
    }
    for col in DELAY_CAUSES {
        rules.push(Rule::coerce(col, NumericKind::Float, CoercePolicy::ZeroFill));
    }
    for col in INTEGER_METRICS {
        rules.push(Rule::coerce(col, NumericKind::Integer, CoercePolicy::NullOnError));
    }

    rules.push(Rule::ParseDate {
        column: FL_DATE.into(),
    });

    for col in [FL_DATE, AIRLINE, ORIGIN, DEST] {
        rules.push(Rule::Require { column: col.into() });
    }

    rules.push(Rule::AirportCode {
        column: ORIGIN.into(),
    });
    rules.push(Rule::AirportCode {
        column: DEST.into(),
    });
    rules.push(Rule::DistinctRoute {
        origin: ORIGIN.into(),
        dest: DEST.into(),
    });

    for col in [CANCELLED, DIVERTED] {
        rules.push(Rule::Flag { column: col.into() });
    }

    for col in DELAY_MINUTES.iter().chain(std::iter::once(&DISTANCE)) {
        rules.push(Rule::Round {
            column: (*col).to_string(),
            digits: 2,
        });
    }

    rules.push(Rule::derive(YEAR, DateField::Year));
    rules.push(Rule::derive(MONTH, DateField::Month));
    rules.push(Rule::derive(DAY_OF_WEEK, DateField::DayOfWeek));
    rules.push(Rule::derive(IS_WEEKEND, DateField::IsWeekend));
    rules
}

/// Record of one stage applied (rows before and after).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub applied_at: DateTime<Utc>,
    pub rows_before: usize,
    pub rows_after: usize,
}

/// Counters collected while cleaning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub empty_rows_removed: usize,
    pub invalid_date_rows_removed: usize,
    pub incomplete_rows_removed: usize,
    pub bad_airport_rows_removed: usize,
    pub self_loop_rows_removed: usize,
    pub unparseable_cells: usize,
    pub zero_filled_cells: usize,
    pub flags_defaulted: usize,
    pub derived_columns: Vec<String>,
    pub skipped_rules: usize,
    pub steps: Vec<StepRecord>,
}

/// A cleaned extract together with what cleaning did to it.
#[derive(Debug, Clone)]
pub struct CleanedExtract {
    pub table: TabularExtract,
    pub report: TransformReport,
}

/// Applies a rule table to extracts.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    rules: Vec<Rule>,
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new(flight_rules())
    }
}

impl TransformEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Clean an extract.
    ///
    /// Only an absent extract fails; bad rows are filtered or coerced.
    pub fn transform(
        &self,
        extract: Option<TabularExtract>,
    ) -> Result<CleanedExtract, TransformError> {
        let mut table = extract.ok_or(TransformError::NoData)?;
        let mut report = TransformReport {
            rows_in: table.row_count(),
            ..Default::default()
        };

        let before = table.row_count();
        report.empty_rows_removed = table.retain_rows(|row| !row_is_empty(row));
        record_step(&mut report, "purge_empty_rows", before, table.row_count());

        for stage in Stage::ORDER {
            let before = table.row_count();
            for rule in self.rules.iter().filter(|r| r.stage() == stage) {
                apply_rule(&mut table, rule, &mut report);
            }
            record_step(&mut report, stage_name(stage), before, table.row_count());
        }

        report.rows_out = table.row_count();
        info!(
            rows_in = report.rows_in,
            rows_out = report.rows_out,
            empty = report.empty_rows_removed,
            invalid_dates = report.invalid_date_rows_removed,
            incomplete = report.incomplete_rows_removed,
            bad_airports = report.bad_airport_rows_removed,
            self_loops = report.self_loop_rows_removed,
            "Transformation complete"
        );
        Ok(CleanedExtract { table, report })
    }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Coerce => "coerce_numeric",
        Stage::ParseDate => "parse_dates",
        Stage::RequireColumns => "require_critical_columns",
        Stage::AirportShape => "airport_code_shape",
        Stage::NormalizeFlags => "normalize_flags",
        Stage::Round => "round_metrics",
        Stage::Derive => "derive_calendar_columns",
    }
}

fn record_step(report: &mut TransformReport, step: &str, rows_before: usize, rows_after: usize) {
    if rows_before != rows_after {
        info!(step, removed = rows_before - rows_after, "Dropped rows");
    }
    report.steps.push(StepRecord {
        step: step.to_string(),
        applied_at: Utc::now(),
        rows_before,
        rows_after,
    });
}

fn apply_rule(table: &mut TabularExtract, rule: &Rule, report: &mut TransformReport) {
    match rule {
        Rule::Coerce {
            column,
            kind,
            policy,
        } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            let (mut failed, mut filled) = (0, 0);
            table.map_column(idx, |cell| match coerce_number(cell, *kind) {
                Some(value) => value,
                None => {
                    if !cell.is_null() {
                        failed += 1;
                    }
                    match policy {
                        CoercePolicy::NullOnError => Cell::Null,
                        CoercePolicy::ZeroFill => {
                            filled += 1;
                            kind.zero()
                        }
                    }
                }
            });
            table.set_column_type(idx, kind.column_type());
            report.unparseable_cells += failed;
            report.zero_filled_cells += filled;
        }
        Rule::ParseDate { column } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            table.map_column(idx, |cell| parse_date(cell).map_or(Cell::Null, Cell::Date));
            table.set_column_type(idx, ColumnType::Date);
            report.invalid_date_rows_removed += table.retain_rows(|row| !row[idx].is_null());
        }
        Rule::Require { column } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            report.incomplete_rows_removed += table.retain_rows(|row| !row[idx].is_null());
        }
        Rule::AirportCode { column } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            report.bad_airport_rows_removed +=
                table.retain_rows(|row| row[idx].is_null() || is_airport_code(&row[idx]));
        }
        Rule::DistinctRoute { origin, dest } => {
            let (Some(o), Some(d)) = (
                present(table, origin, report),
                present(table, dest, report),
            ) else {
                return;
            };
            report.self_loop_rows_removed +=
                table.retain_rows(|row| !is_same_airport(&row[o], &row[d]));
        }
        Rule::Flag { column } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            let mut defaulted = 0;
            table.map_column(idx, |cell| {
                normalize_flag(cell).unwrap_or_else(|| {
                    defaulted += 1;
                    Cell::Int(0)
                })
            });
            table.set_column_type(idx, ColumnType::Integer);
            report.flags_defaulted += defaulted;
        }
        Rule::Round { column, digits } => {
            let Some(idx) = present(table, column, report) else {
                return;
            };
            table.map_column(idx, |cell| match cell {
                Cell::Float(v) => Cell::Float(round_to(*v, *digits)),
                other => other.clone(),
            });
        }
        Rule::Derive {
            column,
            source,
            field,
        } => {
            if table.has_column(column) {
                debug!(column = %column, "Derived column already supplied, keeping it");
                return;
            }
            let Some(src) = present(table, source, report) else {
                return;
            };
            table.push_column(ColumnSchema::new(column.clone(), field.column_type()), |row| {
                row[src].as_date().map_or(Cell::Null, |d| field.compute(d))
            });
            report.derived_columns.push(column.clone());
        }
    }
}

/// Column position, or `None` (counted as a skipped rule) when absent.
fn present(table: &TabularExtract, column: &str, report: &mut TransformReport) -> Option<usize> {
    let idx = table.column_index(column);
    if idx.is_none() {
        debug!(column, "Column absent, rule skipped");
        report.skipped_rules += 1;
    }
    idx
}

/// Parse a cell as a number of the given kind. `None` means missing or
/// unparseable.
pub fn coerce_number(cell: &Cell, kind: NumericKind) -> Option<Cell> {
    let value = match cell {
        Cell::Null | Cell::Date(_) => return None,
        Cell::Int(i) => {
            return Some(match kind {
                NumericKind::Integer => Cell::Int(*i),
                NumericKind::Float => Cell::Float(*i as f64),
            });
        }
        Cell::Float(f) => *f,
        Cell::Bool(b) => f64::from(u8::from(*b)),
        Cell::Text(s) => {
            let s = s.trim();
            if kind == NumericKind::Integer {
                if let Ok(i) = s.parse::<i64>() {
                    return Some(Cell::Int(i));
                }
            }
            s.parse::<f64>().ok()?
        }
    };
    if !value.is_finite() {
        return None;
    }
    match kind {
        NumericKind::Float => Some(Cell::Float(value)),
        NumericKind::Integer => {
            let in_range = value >= i64::MIN as f64 && value <= i64::MAX as f64;
            (value.fract() == 0.0 && in_range).then(|| Cell::Int(value as i64))
        }
    }
}

/// Parse a flight-date cell. Time-of-day parts are dropped.
pub fn parse_date(cell: &Cell) -> Option<NaiveDate> {
    let text = match cell {
        Cell::Date(d) => return Some(*d),
        Cell::Text(s) => s.trim(),
        _ => return None,
    };
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Normalize a cancellation/diversion flag to 0/1. `None` means the value
/// was missing or unreadable.
pub fn normalize_flag(cell: &Cell) -> Option<Cell> {
    let set = match cell {
        Cell::Null | Cell::Date(_) => return None,
        Cell::Bool(b) => *b,
        Cell::Int(i) => *i != 0,
        Cell::Float(f) => *f != 0.0 && !f.is_nan(),
        Cell::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            other => match other.parse::<f64>() {
                Ok(v) if v.is_finite() => v != 0.0,
                _ => return None,
            },
        },
    };
    Some(Cell::Int(i64::from(set)))
}

/// Bound on the scaled value below which rounding twice gives the same result.
const ROUND_LIMIT: f64 = 1_125_899_906_842_624.0; // 2^50

fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits.min(i32::MAX as u32) as i32);
    // Larger values are left as they are; scaling them could overflow.
    if !factor.is_finite() || value.abs() >= ROUND_LIMIT / factor {
        return value;
    }
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HEADERS: &[&str] = &["FL_DATE", "AIRLINE", "ORIGIN", "DEST", "DEP_DELAY"];

    fn extract(rows: Vec<Vec<&str>>) -> TabularExtract {
        TabularExtract::from_text_rows(HEADERS, rows).unwrap()
    }

    fn run(table: TabularExtract) -> CleanedExtract {
        TransformEngine::default().transform(Some(table)).unwrap()
    }

    #[test]
    fn test_absent_extract_is_failure() {
        let err = TransformEngine::default().transform(None).unwrap_err();
        assert!(matches!(err, TransformError::NoData));
    }

    #[test]
    fn test_empty_extract_passes_through() {
        let cleaned = run(extract(vec![]));
        assert_eq!(cleaned.table.row_count(), 0);
        assert!(cleaned.table.has_column(columns::YEAR));
    }

    #[test]
    fn test_five_rows_yield_three() {
        let cleaned = run(extract(vec![
            vec!["2023-01-09", "Delta", "JFK", "LAX", "5"],
            vec!["2023-01-10", "", "ATL", "ORD", "0"],
            vec!["2023-01-11", "United", "SFO", "SFO", "-3"],
            vec!["2023-01-12", "American", "DFW", "MIA", "12.5"],
            vec!["2023-01-13", "Southwest", "DEN", "PHX", ""],
        ]));
        assert_eq!(cleaned.table.row_count(), 3);
        assert_eq!(cleaned.report.incomplete_rows_removed, 1);
        assert_eq!(cleaned.report.self_loop_rows_removed, 1);
    }

    #[test]
    fn test_empty_rows_are_purged_first() {
        let cleaned = run(extract(vec![
            vec!["", "", "", "", ""],
            vec!["2023-01-09", "Delta", "JFK", "LAX", "5"],
        ]));
        assert_eq!(cleaned.report.empty_rows_removed, 1);
        assert_eq!(cleaned.report.incomplete_rows_removed, 0);
        assert_eq!(cleaned.table.row_count(), 1);
    }

    #[test]
    fn test_unparseable_dates_are_dropped() {
        let cleaned = run(extract(vec![
            vec!["not-a-date", "Delta", "JFK", "LAX", "5"],
            vec!["1/9/2023 12:00:00 AM", "Delta", "JFK", "LAX", "5"],
            vec!["2023-02-30", "Delta", "JFK", "LAX", "5"],
        ]));
        assert_eq!(cleaned.table.row_count(), 1);
        assert_eq!(cleaned.report.invalid_date_rows_removed, 2);
        assert_eq!(
            cleaned.table.cell(0, columns::FL_DATE),
            Some(&Cell::Date(NaiveDate::from_ymd_opt(2023, 1, 9).unwrap()))
        );
    }

    #[test]
    fn test_airport_code_shape_filter() {
        let cleaned = run(extract(vec![
            vec!["2023-01-09", "Delta", "JFKX", "LAX", "5"],
            vec!["2023-01-09", "Delta", "JFK", "LA", "5"],
            vec!["2023-01-09", "Delta", "JFK", "LAX", "5"],
        ]));
        assert_eq!(cleaned.table.row_count(), 1);
        assert_eq!(cleaned.report.bad_airport_rows_removed, 2);
    }

    #[test]
    fn test_general_numeric_nulls_on_error() {
        let cleaned = run(extract(vec![vec!["2023-01-09", "Delta", "JFK", "LAX", "late"]]));
        assert_eq!(cleaned.table.cell(0, "DEP_DELAY"), Some(&Cell::Null));
        assert_eq!(cleaned.report.unparseable_cells, 1);
        assert_eq!(cleaned.table.row_count(), 1);
    }

    #[test]
    fn test_delay_causes_zero_fill() {
        let table = TabularExtract::from_text_rows(
            &["FL_DATE", "AIRLINE", "DELAY_DUE_WEATHER", "DELAY_DUE_NAS"],
            vec![vec!["2023-01-09", "Delta", "n/a-ish", ""]],
        )
        .unwrap();
        let cleaned = run(table);
        assert_eq!(cleaned.table.cell(0, "DELAY_DUE_WEATHER"), Some(&Cell::Float(0.0)));
        assert_eq!(cleaned.table.cell(0, "DELAY_DUE_NAS"), Some(&Cell::Float(0.0)));
        assert_eq!(cleaned.report.zero_filled_cells, 2);
    }

    #[test]
    fn test_flags_default_to_zero() {
        let table = TabularExtract::from_text_rows(
            &["FL_DATE", "AIRLINE", "CANCELLED", "DIVERTED"],
            vec![
                vec!["2023-01-09", "Delta", "", "1.0"],
                vec!["2023-01-10", "Delta", "true", "0"],
            ],
        )
        .unwrap();
        let cleaned = run(table);
        assert_eq!(cleaned.table.cell(0, columns::CANCELLED), Some(&Cell::Int(0)));
        assert_eq!(cleaned.table.cell(0, columns::DIVERTED), Some(&Cell::Int(1)));
        assert_eq!(cleaned.table.cell(1, columns::CANCELLED), Some(&Cell::Int(1)));
        assert_eq!(cleaned.report.flags_defaulted, 1);
    }

    #[test]
    fn test_rounding_to_two_digits() {
        let cleaned = run(extract(vec![vec!["2023-01-09", "Delta", "JFK", "LAX", "12.3456"]]));
        assert_eq!(cleaned.table.cell(0, "DEP_DELAY"), Some(&Cell::Float(12.35)));
    }

    #[test]
    fn test_rounding_leaves_huge_values_finite() {
        let engine = TransformEngine::default();
        let once = engine
            .transform(Some(extract(vec![vec![
                "2023-01-09",
                "Delta",
                "JFK",
                "LAX",
                "1e307",
            ]])))
            .unwrap();
        assert_eq!(once.table.cell(0, "DEP_DELAY"), Some(&Cell::Float(1e307)));

        let twice = engine.transform(Some(once.table.clone())).unwrap();
        assert_eq!(twice.table, once.table);
        assert_eq!(round_to(-1e300, 2), -1e300);
        assert_eq!(round_to(2.5e15, 2), 2.5e15);
    }

    #[test]
    fn test_derived_calendar_columns() {
        // 2023-01-14 is a Saturday.
        let cleaned = run(extract(vec![vec!["2023-01-14", "Delta", "JFK", "LAX", "0"]]));
        let t = &cleaned.table;
        assert_eq!(t.cell(0, columns::YEAR), Some(&Cell::Int(2023)));
        assert_eq!(t.cell(0, columns::MONTH), Some(&Cell::Int(1)));
        assert_eq!(t.cell(0, columns::DAY_OF_WEEK), Some(&Cell::Int(6)));
        assert_eq!(t.cell(0, columns::IS_WEEKEND), Some(&Cell::Bool(true)));
        assert_eq!(
            cleaned.report.derived_columns,
            vec!["YEAR", "MONTH", "DAY_OF_WEEK", "IS_WEEKEND"]
        );
    }

    #[test]
    fn test_upstream_derived_column_is_kept() {
        let table = TabularExtract::from_text_rows(
            &["FL_DATE", "AIRLINE", "YEAR"],
            vec![vec!["2023-01-09", "Delta", "upstream"]],
        )
        .unwrap();
        let cleaned = run(table);
        assert_eq!(cleaned.table.cell(0, columns::YEAR), Some(&Cell::from("upstream")));
        assert!(!cleaned.report.derived_columns.contains(&"YEAR".to_string()));
    }

    #[test]
    fn test_absent_columns_are_skipped() {
        let table =
            TabularExtract::from_text_rows(&["AIRLINE", "NOTE"], vec![vec!["Delta", "x"]]).unwrap();
        let cleaned = run(table);
        assert_eq!(cleaned.table.row_count(), 1);
        assert_eq!(cleaned.table.column_names(), vec!["AIRLINE", "NOTE"]);
        assert!(cleaned.report.skipped_rules > 0);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let first = run(extract(vec![
            vec!["2023-01-09", "Delta", "JFK", "LAX", "5.555"],
            vec!["2023-01-10", "United", "ORD", "ORD", "1"],
            vec!["bad", "United", "ORD", "SEA", "1"],
        ]));
        let second = run(first.table.clone());
        assert_eq!(second.table, first.table);
        assert!(second.report.derived_columns.is_empty());
    }

    #[test]
    fn test_coerce_number_integer_kind() {
        assert_eq!(
            coerce_number(&Cell::from("1155.0"), NumericKind::Integer),
            Some(Cell::Int(1155))
        );
        assert_eq!(coerce_number(&Cell::from("11.5"), NumericKind::Integer), None);
        assert_eq!(coerce_number(&Cell::from("inf"), NumericKind::Float), None);
        assert_eq!(
            coerce_number(&Cell::Int(7), NumericKind::Float),
            Some(Cell::Float(7.0))
        );
    }

    #[test]
    fn test_rule_serde_roundtrip() {
        let rule = Rule::Round {
            column: "DISTANCE".into(),
            digits: 2,
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"rule\":\"round\""));
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
