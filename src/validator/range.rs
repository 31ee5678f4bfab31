//! Parsing of reference-range and critical-value texts.
//!
//! Reference ranges: `"12.0-16.0"` (inclusive), `"<200"`, `"<=200"`, `">40"`,
//! `">=40"`, categorical text such as `"Negative"`, and sex-qualified lists
//! like `">40 (M), >50 (F)"`. Critical values: alternatives joined by `or`,
//! e.g. `"<7.0 or >20.0"`, `">100"`, `"3+ or 4+"`.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::enums::{Gender, ResultFlag};

static INTERVAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)\s*-\s*(-?\d+(?:\.\d+)?)$").unwrap()
});

static BOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(<=|>=|≤|≥|<|>)\s*(-?\d+(?:\.\d+)?)$").unwrap());

static SEX_QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+?)\s*\((m|f|male|female)\)$").unwrap());

static ALTERNATIVES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\s+or\s+").unwrap());

/// One normal-range clause.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceRange {
    Between { low: f64, high: f64 },
    Below { limit: f64, inclusive: bool },
    Above { limit: f64, inclusive: bool },
    /// Expected categorical value, matched case-insensitively.
    Expected(String),
}

impl ReferenceRange {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Expected(_))
    }

    /// Normal/low/high for a numeric value. `None` for categorical ranges.
    pub fn classify(&self, value: f64) -> Option<ResultFlag> {
        let flag = match *self {
            Self::Between { low, high } => {
                if value < low {
                    ResultFlag::Low
                } else if value > high {
                    ResultFlag::High
                } else {
                    ResultFlag::Normal
                }
            }
            Self::Below { limit, inclusive } => {
                if value < limit || (inclusive && value == limit) {
                    ResultFlag::Normal
                } else {
                    ResultFlag::High
                }
            }
            Self::Above { limit, inclusive } => {
                if value > limit || (inclusive && value == limit) {
                    ResultFlag::Normal
                } else {
                    ResultFlag::Low
                }
            }
            Self::Expected(_) => return None,
        };
        Some(flag)
    }
}

/// A reference range text, possibly split into sex-specific clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    clauses: Vec<(Option<Gender>, ReferenceRange)>,
}

impl RangeSpec {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("reference range is empty".into());
        }

        let pieces: Vec<&str> = text.split(',').map(str::trim).collect();
        let qualified = pieces.len() > 1 && pieces.iter().all(|p| SEX_QUALIFIER.is_match(p));
        if !qualified {
            return Ok(Self {
                clauses: vec![(None, parse_clause(text)?)],
            });
        }

        let mut clauses = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let caps = SEX_QUALIFIER
                .captures(piece)
                .ok_or_else(|| format!("unreadable clause {piece:?}"))?;
            let gender = match caps[2].to_ascii_lowercase().as_str() {
                "m" | "male" => Gender::Male,
                _ => Gender::Female,
            };
            clauses.push((Some(gender), parse_clause(&caps[1])?));
        }
        Ok(Self { clauses })
    }

    /// The clause for `gender`, falling back to an unqualified clause and then
    /// to the first one.
    pub fn select(&self, gender: Option<Gender>) -> &ReferenceRange {
        let matching = gender.and_then(|g| self.clauses.iter().find(|(q, _)| *q == Some(g)));
        let unqualified = || self.clauses.iter().find(|(q, _)| q.is_none());
        let first = &self.clauses[0];
        &matching.or_else(unqualified).unwrap_or(first).1
    }

    pub fn is_numeric(&self) -> bool {
        self.clauses.iter().all(|(_, r)| r.is_numeric())
    }
}

fn parse_clause(text: &str) -> Result<ReferenceRange, String> {
    let text = text.trim();
    if let Some(caps) = INTERVAL.captures(text) {
        if let (Ok(low), Ok(high)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) {
            if low > high {
                return Err(format!(
                    "reference range {text:?} has its low bound above its high bound"
                ));
            }
            return Ok(ReferenceRange::Between { low, high });
        }
    }
    if let Some((op, limit)) = parse_bound(text) {
        return Ok(match op {
            "<" => ReferenceRange::Below { limit, inclusive: false },
            "<=" | "≤" => ReferenceRange::Below { limit, inclusive: true },
            ">" => ReferenceRange::Above { limit, inclusive: false },
            _ => ReferenceRange::Above { limit, inclusive: true },
        });
    }
    Ok(ReferenceRange::Expected(text.to_string()))
}

fn parse_bound(text: &str) -> Option<(&str, f64)> {
    let caps = BOUND.captures(text)?;
    let op = caps.get(1)?.as_str();
    let limit = caps[2].parse().ok()?;
    Some((op, limit))
}

/// Emergency thresholds. A numeric value strictly beyond `low`/`high` is
/// critical (`<=`/`>=` make the threshold itself critical); categorical
/// values match `values` case-insensitively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CriticalThresholds {
    pub low: Option<(f64, bool)>,
    pub high: Option<(f64, bool)>,
    pub values: Vec<String>,
}

impl CriticalThresholds {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut thresholds = Self::default();
        for part in ALTERNATIVES.split(text.trim()).map(str::trim) {
            if part.is_empty() {
                return Err(format!("critical values {text:?} has an empty alternative"));
            }
            match parse_bound(part) {
                Some(("<", v)) => thresholds.set_low(v, false, text)?,
                Some(("<=" | "≤", v)) => thresholds.set_low(v, true, text)?,
                Some((">", v)) => thresholds.set_high(v, false, text)?,
                Some((_, v)) => thresholds.set_high(v, true, text)?,
                None => thresholds.values.push(part.to_string()),
            }
        }
        if let (Some((low, _)), Some((high, _))) = (thresholds.low, thresholds.high) {
            if low >= high {
                return Err(format!(
                    "critical values {text:?} leave no value between the low and high thresholds"
                ));
            }
        }
        Ok(thresholds)
    }

    fn set_low(&mut self, v: f64, inclusive: bool, text: &str) -> Result<(), String> {
        if self.low.replace((v, inclusive)).is_some() {
            return Err(format!("critical values {text:?} has two low thresholds"));
        }
        Ok(())
    }

    fn set_high(&mut self, v: f64, inclusive: bool, text: &str) -> Result<(), String> {
        if self.high.replace((v, inclusive)).is_some() {
            return Err(format!("critical values {text:?} has two high thresholds"));
        }
        Ok(())
    }

    pub fn is_numeric(&self) -> bool {
        self.values.is_empty()
    }

    pub fn classify(&self, value: f64) -> Option<ResultFlag> {
        if let Some((limit, inclusive)) = self.low {
            if value < limit || (inclusive && value == limit) {
                return Some(ResultFlag::CriticalLow);
            }
        }
        if let Some((limit, inclusive)) = self.high {
            if value > limit || (inclusive && value == limit) {
                return Some(ResultFlag::CriticalHigh);
            }
        }
        None
    }

    pub fn matches_text(&self, value: &str) -> bool {
        self.values.iter().any(|v| v.eq_ignore_ascii_case(value.trim()))
    }
}
