use crate::strategy::SignalFrame;

/// True when `series` crosses above `level` at row `i`.
pub fn crossed_above_level(series: &[f64], level: f64, i: usize) -> bool {
    i > 0 && i < series.len() && series[i - 1] <= level && series[i] > level
}

pub fn crossed_below_level(series: &[f64], level: f64, i: usize) -> bool {
    i > 0 && i < series.len() && series[i - 1] >= level && series[i] < level
}

/// Marks an entry at row `i`, tagging it when `tag` is given.
pub fn mark_entry(frame: &mut SignalFrame, i: usize, is_short: bool, tag: Option<&str>) {
    if i >= frame.len() {
        return;
    }
    if is_short {
        frame.enter_short[i] = true;
    } else {
        frame.enter_long[i] = true;
    }
    if let Some(tag) = tag {
        frame.enter_tag[i] = Some(tag.to_string());
    }
}

pub fn mark_exit(frame: &mut SignalFrame, i: usize, is_short: bool, tag: Option<&str>) {
    if i >= frame.len() {
        return;
    }
    if is_short {
        frame.exit_short[i] = true;
    } else {
        frame.exit_long[i] = true;
    }
    if let Some(tag) = tag {
        frame.exit_tag[i] = Some(tag.to_string());
    }
}

/// All values finite at `i` (past indicator warm-up).
pub fn all_finite(values: &[&[f64]], i: usize) -> bool {
    values
        .iter()
        .all(|series| series.get(i).map_or(false, |v| v.is_finite()))
}

/// Whole days between two dates, at least one.
pub fn calculate_period_days(
    start: &chrono::DateTime<chrono::Utc>,
    end: &chrono::DateTime<chrono::Utc>,
) -> i64 {
    let start_date = start.date_naive();
    let end_date = end.date_naive();

    if end_date < start_date {
        return 0;
    }

    let diff = (end_date - start_date).num_days();
    if diff <= 0 {
        1
    } else {
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn level_crossings() {
        let rsi = [25.0, 31.0, 29.0];
        assert!(crossed_above_level(&rsi, 30.0, 1));
        assert!(crossed_below_level(&rsi, 30.0, 2));
        assert!(!crossed_above_level(&rsi, 30.0, 0));
    }

    #[test]
    fn period_days_never_zero_for_ordered_dates() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        assert_eq!(calculate_period_days(&start, &end), 1);
        let later = Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap();
        assert_eq!(calculate_period_days(&start, &later), 10);
        assert_eq!(calculate_period_days(&later, &start), 0);
    }

    #[test]
    fn finite_check_handles_warmup() {
        let a = [f64::NAN, 1.0];
        let b = [1.0, 2.0];
        assert!(!all_finite(&[&a, &b], 0));
        assert!(all_finite(&[&a, &b], 1));
        assert!(!all_finite(&[&a], 5));
    }
}
