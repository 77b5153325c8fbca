//! Schedule configuration for `scheduled` tasks.

use chrono::NaiveTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// When a scheduled task should be started.
///
/// Weekdays use ISO numbering (1 = Monday .. 7 = Sunday). Empty weekday and
/// monthday sets mean "every day".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Explicit clock times, optionally restricted to weekdays and/or monthdays.
    ClockTimes {
        times: Vec<NaiveTime>,
        #[serde(default)]
        weekdays: Vec<u8>,
        #[serde(default)]
        monthdays: Vec<u8>,
        #[serde(default)]
        duration_minutes: Option<u32>,
    },
    /// Every `every_minutes` between `start` (inclusive) and `end` (exclusive).
    Window {
        start: NaiveTime,
        end: NaiveTime,
        every_minutes: u32,
        #[serde(default)]
        weekdays: Vec<u8>,
        #[serde(default)]
        duration_minutes: Option<u32>,
    },
}

impl ScheduleSpec {
    /// Minutes after each trigger at which the task is stopped again.
    pub fn duration_minutes(&self) -> Option<u32> {
        match self {
            ScheduleSpec::ClockTimes {
                duration_minutes, ..
            }
            | ScheduleSpec::Window {
                duration_minutes, ..
            } => *duration_minutes,
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        let check_weekdays = |days: &[u8]| -> ModelResult<()> {
            match days.iter().find(|d| !(1..=7).contains(*d)) {
                Some(d) => Err(ModelError::invalid_schedule(format!(
                    "weekday {} outside 1..=7",
                    d
                ))),
                None => Ok(()),
            }
        };

        match self {
            ScheduleSpec::ClockTimes {
                times,
                weekdays,
                monthdays,
                duration_minutes,
            } => {
                if times.is_empty() {
                    return Err(ModelError::invalid_schedule(
                        "clock schedule needs at least one time",
                    ));
                }
                check_weekdays(weekdays)?;
                if let Some(d) = monthdays.iter().find(|d| !(1..=31).contains(*d)) {
                    return Err(ModelError::invalid_schedule(format!(
                        "monthday {} outside 1..=31",
                        d
                    )));
                }
                if *duration_minutes == Some(0) {
                    return Err(ModelError::invalid_schedule("duration must be positive"));
                }
            }
            ScheduleSpec::Window {
                start,
                end,
                every_minutes,
                weekdays,
                duration_minutes,
            } => {
                if start >= end {
                    return Err(ModelError::invalid_schedule(
                        "window start must be before end",
                    ));
                }
                if *every_minutes == 0 {
                    return Err(ModelError::invalid_schedule(
                        "window interval must be positive",
                    ));
                }
                check_weekdays(weekdays)?;
                if *duration_minutes == Some(0) {
                    return Err(ModelError::invalid_schedule("duration must be positive"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clock_times() {
        let spec: ScheduleSpec = serde_json::from_value(serde_json::json!({
            "kind": "clock_times",
            "times": ["08:00:00", "20:30:00"],
            "weekdays": [1, 2, 3, 4, 5],
            "duration_minutes": 60
        }))
        .unwrap();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.duration_minutes(), Some(60));
    }

    #[test]
    fn test_window_bounds_validated() {
        let spec = ScheduleSpec::Window {
            start: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            every_minutes: 30,
            weekdays: vec![],
            duration_minutes: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_bad_weekday_rejected() {
        let spec = ScheduleSpec::ClockTimes {
            times: vec![NaiveTime::from_hms_opt(8, 0, 0).unwrap()],
            weekdays: vec![0],
            monthdays: vec![],
            duration_minutes: None,
        };
        assert!(spec.validate().is_err());
    }
}
