//! Pure next-occurrence calculation.
//!
//! Given a recurrence rule, a set of time-of-day entries, and a reference
//! instant, computes the earliest instant at or after the reference that
//! matches one of the times and satisfies the rule. Deterministic and
//! clock-free; all instants are device-local wall-clock.

use crate::types::{Medication, Recurrence};
use chrono::{Datelike, Days, Duration, NaiveDateTime, NaiveTime, Timelike};

/// Earliest instant `>= reference` matching one of `times` and allowed by
/// `recurrence`.
///
/// Returns `None` when no occurrence can ever exist: empty `times`, or a
/// `WeeklyOn` rule with an empty weekday set.
pub fn next_occurrence(
    recurrence: &Recurrence,
    times: &[NaiveTime],
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    if recurrence.is_empty() || times.is_empty() {
        return None;
    }

    times
        .iter()
        .filter_map(|time| candidate_for(recurrence, *time, reference))
        .min()
}

/// Convenience wrapper over a medication's own rule and times.
pub fn next_for_medication(
    medication: &Medication,
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    next_occurrence(
        &medication.recurrence,
        &medication.reminder_times,
        reference,
    )
}

/// Next valid instant for a single time-of-day entry.
///
/// Starts from "today at hour:minute"; if that is strictly before the
/// reference, moves one day forward. For weekly rules, scans forward at
/// most 7 days (the rule is periodic weekly) to the next allowed weekday,
/// keeping the same time of day.
fn candidate_for(
    recurrence: &Recurrence,
    time: NaiveTime,
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    // Reminder times carry no seconds
    let time = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0)?;

    let mut candidate = reference.date().and_time(time);
    if candidate < reference {
        candidate += Duration::days(1);
    }

    match recurrence {
        Recurrence::Daily => Some(candidate),
        Recurrence::WeeklyOn(days) if days.is_empty() => None,
        Recurrence::WeeklyOn(_) => (0..7)
            .filter_map(|offset| candidate.date().checked_add_days(Days::new(offset)))
            .find(|day| recurrence.fires_on(day.weekday()))
            .map(|day| day.and_time(time)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn t(h: u32, mi: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, mi, 0).unwrap()
    }

    /// Minute-by-minute brute force over 8 days, used as an oracle.
    fn brute_force(
        recurrence: &Recurrence,
        times: &[NaiveTime],
        reference: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        let mut cursor = reference;
        let end = reference + Duration::days(8);
        while cursor <= end {
            let hm = NaiveTime::from_hms_opt(cursor.hour(), cursor.minute(), 0).unwrap();
            if cursor.time() == hm
                && times.contains(&hm)
                && recurrence.fires_on(cursor.date().weekday())
            {
                return Some(cursor);
            }
            cursor += Duration::minutes(1);
        }
        None
    }

    #[test]
    fn test_daily_before_slot_fires_today() {
        // 2024-06-03 is a Monday
        let next = next_occurrence(&Recurrence::Daily, &[t(8, 0)], dt(2024, 6, 3, 7, 0));
        assert_eq!(next, Some(dt(2024, 6, 3, 8, 0)));
    }

    #[test]
    fn test_daily_after_slot_fires_tomorrow() {
        let next = next_occurrence(&Recurrence::Daily, &[t(8, 0)], dt(2024, 6, 3, 8, 1));
        assert_eq!(next, Some(dt(2024, 6, 4, 8, 0)));
    }

    #[test]
    fn test_exact_reference_counts_as_today() {
        let next = next_occurrence(&Recurrence::Daily, &[t(8, 0)], dt(2024, 6, 3, 8, 0));
        assert_eq!(next, Some(dt(2024, 6, 3, 8, 0)));
    }

    #[test]
    fn test_weekly_skips_to_allowed_day() {
        // Reference is Tuesday 09:30; Monday/Wednesday rule at 09:00 should
        // land on Wednesday 09:00.
        let rule = Recurrence::WeeklyOn(vec![Weekday::Mon, Weekday::Wed]);
        let next = next_occurrence(&rule, &[t(9, 0)], dt(2024, 6, 4, 9, 30));
        assert_eq!(next, Some(dt(2024, 6, 5, 9, 0)));
    }

    #[test]
    fn test_weekly_wraps_across_week_boundary() {
        // Monday-only rule, reference Tuesday: next Monday, six days out.
        let rule = Recurrence::WeeklyOn(vec![Weekday::Mon]);
        let next = next_occurrence(&rule, &[t(9, 0)], dt(2024, 6, 4, 10, 0));
        assert_eq!(next, Some(dt(2024, 6, 10, 9, 0)));
    }

    #[test]
    fn test_weekly_same_day_slot_still_ahead() {
        // Tuesday rule, reference Tuesday 08:00, slot 09:00: fires today.
        let rule = Recurrence::WeeklyOn(vec![Weekday::Tue]);
        let next = next_occurrence(&rule, &[t(9, 0)], dt(2024, 6, 4, 8, 0));
        assert_eq!(next, Some(dt(2024, 6, 4, 9, 0)));
    }

    #[test]
    fn test_empty_times_yields_none() {
        assert_eq!(
            next_occurrence(&Recurrence::Daily, &[], dt(2024, 6, 3, 7, 0)),
            None
        );
    }

    #[test]
    fn test_empty_weekday_set_yields_none() {
        let rule = Recurrence::WeeklyOn(vec![]);
        assert_eq!(next_occurrence(&rule, &[t(8, 0)], dt(2024, 6, 3, 7, 0)), None);
    }

    #[test]
    fn test_earliest_across_multiple_times() {
        let times = [t(20, 0), t(8, 0), t(13, 30)];
        let next = next_occurrence(&Recurrence::Daily, &times, dt(2024, 6, 3, 9, 15));
        assert_eq!(next, Some(dt(2024, 6, 3, 13, 30)));
    }

    #[test]
    fn test_result_is_never_before_reference() {
        let rules = [
            Recurrence::Daily,
            Recurrence::WeeklyOn(vec![Weekday::Sun]),
            Recurrence::WeeklyOn(vec![Weekday::Mon, Weekday::Fri]),
        ];
        let times = [t(0, 0), t(8, 0), t(23, 59)];
        for rule in &rules {
            for minute_offset in [0i64, 1, 59, 60 * 7 + 3, 60 * 26] {
                let reference = dt(2024, 6, 3, 0, 0) + Duration::minutes(minute_offset);
                let next = next_occurrence(rule, &times, reference).unwrap();
                assert!(next >= reference, "{next} < {reference} under {rule:?}");
            }
        }
    }

    #[test]
    fn test_matches_brute_force_oracle() {
        let cases = [
            (Recurrence::Daily, vec![t(8, 0)]),
            (Recurrence::Daily, vec![t(8, 0), t(20, 0)]),
            (Recurrence::WeeklyOn(vec![Weekday::Mon, Weekday::Wed]), vec![t(9, 0)]),
            (Recurrence::WeeklyOn(vec![Weekday::Sat]), vec![t(6, 45), t(22, 10)]),
        ];
        let references = [
            dt(2024, 6, 3, 7, 0),
            dt(2024, 6, 4, 9, 30),
            dt(2024, 6, 7, 23, 59),
            dt(2024, 6, 9, 0, 0),
        ];

        for (rule, times) in &cases {
            for reference in references {
                assert_eq!(
                    next_occurrence(rule, times, reference),
                    brute_force(rule, times, reference),
                    "mismatch for {rule:?} at {reference}"
                );
            }
        }
    }

    #[test]
    fn test_seconds_in_times_are_ignored() {
        let with_seconds = NaiveTime::from_hms_opt(8, 0, 30).unwrap();
        let next = next_occurrence(&Recurrence::Daily, &[with_seconds], dt(2024, 6, 3, 7, 0));
        assert_eq!(next, Some(dt(2024, 6, 3, 8, 0)));
    }
}
