//! Repeat-rule evaluation.

use chrono::{DateTime, Utc};
use croner::Cron;

use jobkeeper_engine::{EngineError, EngineResult};

fn parse(pattern: &str) -> EngineResult<Cron> {
    Cron::new(pattern)
        .with_seconds_optional()
        .parse()
        .map_err(|e| EngineError::InvalidRepeatPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// First occurrence of `pattern` strictly after `after`.
pub fn next_occurrence(pattern: &str, after: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    parse(pattern)?
        .find_next_occurrence(&after, false)
        .map_err(|e| EngineError::InvalidRepeatPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Key under which a repeat rule is registered: one rule per name and pattern.
pub fn repeat_key(name: &str, pattern: &str) -> String {
    format!("{name}:{pattern}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn hourly_pattern_lands_on_the_hour() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap();
        let next = next_occurrence("0 0 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn five_field_patterns_are_accepted() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap();
        let next = next_occurrence("*/5 * * * *", after).unwrap();
        assert_eq!(next.minute(), 20);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn occurrence_is_strictly_after_start() {
        let on_the_hour = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let next = next_occurrence("0 0 * * * *", on_the_hour).unwrap();
        assert!(next > on_the_hour);
    }

    #[test]
    fn garbage_pattern_is_rejected() {
        let err = next_occurrence("every tuesday", Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRepeatPattern { .. }));
    }
}
