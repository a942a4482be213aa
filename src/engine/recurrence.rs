use std::collections::HashSet;

use chrono::{Datelike, Duration, NaiveDate};

use crate::model::{Frequency, Recurrence};

// ── Recurrence Algorithm ──────────────────────────────────────────

/// Enumerate the dates a rule should generate bookings for, in
/// chronological order.
///
/// The scan starts at `max(start_date, today)` aligned forward to the
/// first real occurrence, and advances by whole interval steps from
/// there. Every iteration advances the cursor, so the loop is bounded
/// by the horizon. Dates in `skip` or `existing` are passed over
/// without disturbing the cadence.
///
/// Boundaries: `horizon_end = today + weeks` is exclusive; `end_date`
/// is inclusive — a cursor equal to it still generates, the next one
/// stops the scan.
pub fn occurrence_dates(
    rec: &Recurrence,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    today: NaiveDate,
    horizon_weeks: u32,
    skip: &HashSet<NaiveDate>,
    existing: &HashSet<NaiveDate>,
) -> Vec<NaiveDate> {
    let horizon_end = today + Duration::weeks(horizon_weeks as i64);
    // Generation never targets a date before today, even for historical
    // start dates.
    let origin = start_date.max(today);

    let Some(mut cursor) = first_occurrence_on_or_after(rec, origin) else {
        // Rule is missing the day field its cadence needs: storable but
        // inert. A no-op, not an error.
        return Vec::new();
    };

    let mut dates = Vec::new();
    while cursor < horizon_end {
        if let Some(end) = end_date
            && cursor > end {
                break;
            }
        if !skip.contains(&cursor) && !existing.contains(&cursor) && matches_day(rec, cursor) {
            dates.push(cursor);
        }
        let next = next_occurrence(rec, cursor);
        if next <= cursor {
            // interval=0 is rejected at intake; this keeps the loop
            // total regardless.
            break;
        }
        cursor = next;
    }
    dates
}

/// Does `date` land on the rule's pinned day? Interval skipping is the
/// advancement step's concern, not this test's.
pub fn matches_day(rec: &Recurrence, date: NaiveDate) -> bool {
    match rec.frequency {
        Frequency::Weekly | Frequency::Biweekly => rec.day_of_week == Some(date.weekday()),
        Frequency::Monthly => match rec.day_of_month {
            Some(dom) => {
                let last = days_in_month(date.year(), date.month());
                date.day() == dom || (dom > last && date.day() == last)
            }
            None => false,
        },
        Frequency::Custom => rec.day_of_week.is_none_or(|dow| dow == date.weekday()),
    }
}

/// The first date on or after `from` that the rule can fire on, or
/// `None` when the cadence's day pin is absent (Weekly/Biweekly without
/// day_of_week, Monthly without day_of_month).
pub fn first_occurrence_on_or_after(rec: &Recurrence, from: NaiveDate) -> Option<NaiveDate> {
    match rec.frequency {
        Frequency::Weekly | Frequency::Biweekly => {
            rec.day_of_week.map(|dow| align_weekday(from, dow))
        }
        Frequency::Monthly => {
            let dom = rec.day_of_month?;
            let this_month = clamp_to_month(from.year(), from.month(), dom);
            if this_month >= from {
                Some(this_month)
            } else {
                let (y, m) = next_month(from.year(), from.month());
                Some(clamp_to_month(y, m, dom))
            }
        }
        Frequency::Custom => match rec.day_of_week {
            Some(dow) => Some(align_weekday(from, dow)),
            None => Some(from),
        },
    }
}

/// Next cursor position after `cursor`. Weekly steps preserve the
/// weekday by construction; monthly steps re-anchor to the rule's
/// day-of-month so a clamped short month doesn't drift the anchor.
pub fn next_occurrence(rec: &Recurrence, cursor: NaiveDate) -> NaiveDate {
    match rec.frequency {
        Frequency::Weekly => cursor + Duration::weeks(rec.interval as i64),
        Frequency::Biweekly => cursor + Duration::weeks(2 * rec.interval as i64),
        Frequency::Monthly => {
            let anchor = rec.day_of_month.unwrap_or_else(|| cursor.day());
            add_months_clamped(cursor, rec.interval, anchor)
        }
        Frequency::Custom => cursor + Duration::weeks(rec.interval as i64),
    }
}

/// Step `from` forward (0-6 days) to the requested weekday.
fn align_weekday(from: NaiveDate, target: chrono::Weekday) -> NaiveDate {
    let ahead = (target.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    from + Duration::days(ahead)
}

/// `months` forward from `date`, with the day re-anchored to
/// `min(anchor_day, month length)`. Jan 31 + 1 month with anchor 31 is
/// Feb 28/29; + 2 months is Mar 31 again.
pub fn add_months_clamped(date: NaiveDate, months: u32, anchor_day: u32) -> NaiveDate {
    let total = date.year() * 12 + date.month0() as i32 + months as i32;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    clamp_to_month(year, month, anchor_day)
}

fn clamp_to_month(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.max(1).min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("clamped day fits the month")
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .expect("month arithmetic stays in range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn weekly(interval: u32, dow: Option<Weekday>) -> Recurrence {
        Recurrence {
            frequency: Frequency::Weekly,
            interval,
            day_of_week: dow,
            day_of_month: None,
        }
    }

    fn biweekly(dow: Weekday) -> Recurrence {
        Recurrence {
            frequency: Frequency::Biweekly,
            interval: 1,
            day_of_week: Some(dow),
            day_of_month: None,
        }
    }

    fn monthly(dom: Option<u32>) -> Recurrence {
        Recurrence {
            frequency: Frequency::Monthly,
            interval: 1,
            day_of_week: None,
            day_of_month: dom,
        }
    }

    fn custom(interval: u32, dow: Option<Weekday>) -> Recurrence {
        Recurrence {
            frequency: Frequency::Custom,
            interval,
            day_of_week: dow,
            day_of_month: None,
        }
    }

    fn dates(
        rec: &Recurrence,
        start: NaiveDate,
        end: Option<NaiveDate>,
        today: NaiveDate,
        weeks: u32,
    ) -> Vec<NaiveDate> {
        occurrence_dates(
            rec,
            start,
            end,
            today,
            weeks,
            &HashSet::new(),
            &HashSet::new(),
        )
    }

    // ── helpers ───────────────────────────────────────────

    #[test]
    fn align_weekday_basics() {
        // 2026-08-05 is a Wednesday
        let wed = d(2026, 8, 5);
        assert_eq!(align_weekday(wed, Weekday::Wed), wed);
        assert_eq!(align_weekday(wed, Weekday::Thu), d(2026, 8, 6));
        assert_eq!(align_weekday(wed, Weekday::Mon), d(2026, 8, 10));
        assert_eq!(align_weekday(wed, Weekday::Tue), d(2026, 8, 11));
    }

    #[test]
    fn days_in_month_table() {
        assert_eq!(days_in_month(2026, 1), 31);
        assert_eq!(days_in_month(2026, 2), 28);
        assert_eq!(days_in_month(2024, 2), 29); // leap
        assert_eq!(days_in_month(2026, 4), 30);
        assert_eq!(days_in_month(2026, 12), 31);
    }

    #[test]
    fn add_months_keeps_anchor_through_short_months() {
        let jan31 = d(2026, 1, 31);
        let feb = add_months_clamped(jan31, 1, 31);
        assert_eq!(feb, d(2026, 2, 28));
        let mar = add_months_clamped(feb, 1, 31);
        assert_eq!(mar, d(2026, 3, 31));
    }

    #[test]
    fn add_months_leap_february() {
        assert_eq!(add_months_clamped(d(2024, 1, 31), 1, 31), d(2024, 2, 29));
        assert_eq!(add_months_clamped(d(2024, 1, 30), 1, 30), d(2024, 2, 29));
    }

    #[test]
    fn add_months_across_year_boundary() {
        assert_eq!(add_months_clamped(d(2026, 11, 15), 3, 15), d(2027, 2, 15));
    }

    #[test]
    fn first_occurrence_monthly_same_month() {
        let rec = monthly(Some(20));
        assert_eq!(
            first_occurrence_on_or_after(&rec, d(2026, 8, 5)),
            Some(d(2026, 8, 20))
        );
    }

    #[test]
    fn first_occurrence_monthly_rolls_to_next_month() {
        let rec = monthly(Some(3));
        assert_eq!(
            first_occurrence_on_or_after(&rec, d(2026, 8, 5)),
            Some(d(2026, 9, 3))
        );
    }

    #[test]
    fn first_occurrence_missing_day_pin_is_none() {
        assert_eq!(first_occurrence_on_or_after(&weekly(1, None), d(2026, 8, 5)), None);
        assert_eq!(first_occurrence_on_or_after(&monthly(None), d(2026, 8, 5)), None);
    }

    // ── matches_day ───────────────────────────────────────

    #[test]
    fn matches_day_weekly() {
        let rec = weekly(1, Some(Weekday::Mon));
        assert!(matches_day(&rec, d(2026, 8, 10))); // Monday
        assert!(!matches_day(&rec, d(2026, 8, 11)));
    }

    #[test]
    fn matches_day_monthly_clamped() {
        let rec = monthly(Some(31));
        assert!(matches_day(&rec, d(2026, 1, 31)));
        assert!(matches_day(&rec, d(2026, 4, 30))); // clamped to month end
        assert!(!matches_day(&rec, d(2026, 4, 29)));
    }

    #[test]
    fn matches_day_custom_without_pin_matches_everything() {
        let rec = custom(1, None);
        assert!(matches_day(&rec, d(2026, 8, 5)));
        assert!(matches_day(&rec, d(2026, 8, 6)));
    }

    // ── occurrence_dates ──────────────────────────────────

    #[test]
    fn weekly_four_mondays_from_a_wednesday() {
        // Past Monday start, today is Wednesday 2026-08-05, 4-week horizon:
        // exactly the next four Mondays.
        let rec = weekly(1, Some(Weekday::Mon));
        let out = dates(&rec, d(2025, 8, 4), None, d(2026, 8, 5), 4);
        assert_eq!(
            out,
            vec![d(2026, 8, 10), d(2026, 8, 17), d(2026, 8, 24), d(2026, 8, 31)]
        );
        assert!(out.iter().all(|dt| dt.weekday() == Weekday::Mon));
        assert!(out.iter().all(|dt| *dt > d(2026, 8, 5)));
    }

    #[test]
    fn weekly_interval_two_skips_alternate_weeks() {
        let rec = weekly(2, Some(Weekday::Mon));
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 8);
        assert_eq!(out, vec![d(2026, 8, 10), d(2026, 8, 24), d(2026, 9, 7), d(2026, 9, 21)]);
    }

    #[test]
    fn biweekly_spacing_is_fourteen_days() {
        let rec = biweekly(Weekday::Fri);
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 6);
        assert_eq!(out, vec![d(2026, 8, 7), d(2026, 8, 21), d(2026, 9, 4)]);
    }

    #[test]
    fn monthly_day_31_clamps_over_short_months() {
        let rec = monthly(Some(31));
        let out = dates(&rec, d(2026, 1, 31), None, d(2026, 3, 15), 12);
        // Horizon ends June 7: March 31, April 30 (clamped), May 31.
        assert_eq!(out, vec![d(2026, 3, 31), d(2026, 4, 30), d(2026, 5, 31)]);
    }

    #[test]
    fn monthly_mid_month_day() {
        let rec = monthly(Some(15));
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 13);
        assert_eq!(out, vec![d(2026, 8, 15), d(2026, 9, 15), d(2026, 10, 15)]);
    }

    #[test]
    fn custom_without_pin_fires_every_interval_weeks() {
        let rec = custom(1, None);
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 3);
        assert_eq!(out, vec![d(2026, 8, 5), d(2026, 8, 12), d(2026, 8, 19)]);
    }

    #[test]
    fn custom_with_pin_behaves_weekly() {
        let rec = custom(1, Some(Weekday::Sat));
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 2);
        assert_eq!(out, vec![d(2026, 8, 8), d(2026, 8, 15)]);
    }

    #[test]
    fn past_start_date_clamps_to_today() {
        let rec = weekly(1, Some(Weekday::Mon));
        let out = dates(&rec, d(2025, 8, 4), None, d(2026, 8, 5), 2);
        assert!(!out.is_empty());
        assert!(out.iter().all(|dt| *dt >= d(2026, 8, 5)));
    }

    #[test]
    fn future_start_date_is_respected() {
        let rec = weekly(1, Some(Weekday::Mon));
        let out = dates(&rec, d(2026, 8, 24), None, d(2026, 8, 5), 4);
        assert_eq!(out, vec![d(2026, 8, 24), d(2026, 8, 31)]);
    }

    #[test]
    fn start_beyond_horizon_generates_nothing() {
        let rec = weekly(1, Some(Weekday::Mon));
        let out = dates(&rec, d(2026, 10, 5), None, d(2026, 8, 5), 4);
        assert!(out.is_empty());
    }

    #[test]
    fn end_date_is_inclusive_then_stops() {
        // Weekly Wednesday starting today with end_date ten days out:
        // today and next Wednesday qualify, nothing after.
        let rec = weekly(1, Some(Weekday::Wed));
        let out = dates(&rec, d(2026, 8, 5), Some(d(2026, 8, 15)), d(2026, 8, 5), 10);
        assert_eq!(out, vec![d(2026, 8, 5), d(2026, 8, 12)]);
    }

    #[test]
    fn end_date_exactly_on_occurrence_generates() {
        let rec = weekly(1, Some(Weekday::Wed));
        let out = dates(&rec, d(2026, 8, 5), Some(d(2026, 8, 12)), d(2026, 8, 5), 10);
        assert_eq!(out, vec![d(2026, 8, 5), d(2026, 8, 12)]);
    }

    #[test]
    fn end_date_before_today_generates_nothing() {
        let rec = weekly(1, Some(Weekday::Wed));
        let out = dates(&rec, d(2026, 1, 7), Some(d(2026, 7, 1)), d(2026, 8, 5), 4);
        assert!(out.is_empty());
    }

    #[test]
    fn horizon_end_is_exclusive() {
        // Horizon of exactly one week from a matching day: the day
        // itself generates, the date seven days out does not.
        let rec = weekly(1, Some(Weekday::Wed));
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 1);
        assert_eq!(out, vec![d(2026, 8, 5)]);
    }

    #[test]
    fn skip_dates_are_excluded_without_breaking_cadence() {
        let rec = weekly(1, Some(Weekday::Mon));
        let skip: HashSet<_> = [d(2026, 8, 17)].into();
        let out = occurrence_dates(
            &rec,
            d(2026, 8, 5),
            None,
            d(2026, 8, 5),
            4,
            &skip,
            &HashSet::new(),
        );
        assert_eq!(out, vec![d(2026, 8, 10), d(2026, 8, 24), d(2026, 8, 31)]);
    }

    #[test]
    fn existing_dates_are_excluded() {
        let rec = weekly(1, Some(Weekday::Mon));
        let existing: HashSet<_> = [d(2026, 8, 10), d(2026, 8, 24)].into();
        let out = occurrence_dates(
            &rec,
            d(2026, 8, 5),
            None,
            d(2026, 8, 5),
            4,
            &HashSet::new(),
            &existing,
        );
        assert_eq!(out, vec![d(2026, 8, 17), d(2026, 8, 31)]);
    }

    #[test]
    fn all_dates_existing_yields_empty() {
        let rec = weekly(1, Some(Weekday::Mon));
        let existing: HashSet<_> =
            [d(2026, 8, 10), d(2026, 8, 17), d(2026, 8, 24), d(2026, 8, 31)].into();
        let out = occurrence_dates(
            &rec,
            d(2026, 8, 5),
            None,
            d(2026, 8, 5),
            4,
            &HashSet::new(),
            &existing,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn weekly_without_day_pin_is_silent_noop() {
        let out = dates(&weekly(1, None), d(2026, 8, 5), None, d(2026, 8, 5), 4);
        assert!(out.is_empty());
    }

    #[test]
    fn monthly_without_day_pin_is_silent_noop() {
        let out = dates(&monthly(None), d(2026, 8, 5), None, d(2026, 8, 5), 12);
        assert!(out.is_empty());
    }

    #[test]
    fn zero_interval_terminates() {
        let rec = weekly(0, Some(Weekday::Wed));
        let out = dates(&rec, d(2026, 8, 5), None, d(2026, 8, 5), 4);
        assert!(out.len() <= 1);
    }
}
