//! Fiscal period value object.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerResult, ValidationError};

/// A (year, month) accounting window.
///
/// Ordering is chronological, so `BTreeMap` ranges over periods walk time
/// forwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiscalPeriod {
    year: i32,
    month: u32,
}

impl FiscalPeriod {
    pub fn new(year: i32, month: u32) -> LedgerResult<Self> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(ValidationError::InvalidPeriod { year, month }.into());
        }
        Ok(Self { year, month })
    }

    /// Calendar-month period containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// First calendar day of the period.
    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl core::fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl core::str::FromStr for FiscalPeriod {
    type Err = crate::error::LedgerError;

    /// Parses `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Other(format!("invalid fiscal period '{s}' (expected YYYY-MM)"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_month() {
        assert!(FiscalPeriod::new(2026, 0).is_err());
        assert!(FiscalPeriod::new(2026, 13).is_err());
        assert!(FiscalPeriod::new(2026, 12).is_ok());
    }

    #[test]
    fn previous_wraps_year() {
        let jan = FiscalPeriod::new(2026, 1).unwrap();
        assert_eq!(jan.previous(), FiscalPeriod::new(2025, 12).unwrap());
    }

    #[test]
    fn orders_chronologically() {
        let dec = FiscalPeriod::new(2025, 12).unwrap();
        let jan = FiscalPeriod::new(2026, 1).unwrap();
        assert!(dec < jan);
        assert_eq!(jan.to_string(), "2026-01");
    }

    #[test]
    fn containing_uses_calendar_month() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        assert_eq!(FiscalPeriod::containing(date), FiscalPeriod::new(2026, 1).unwrap());
    }

    #[test]
    fn parses_year_month() {
        assert_eq!("2024-03".parse::<FiscalPeriod>().unwrap(), FiscalPeriod::new(2024, 3).unwrap());
        assert!("2024-13".parse::<FiscalPeriod>().is_err());
        assert!("march".parse::<FiscalPeriod>().is_err());
    }
}
