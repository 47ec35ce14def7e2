//! Cron-expression construction for [`RecurrenceKind`], the core's own
//! logic rather than something the `cron` crate is asked to do — in
//! particular the `L` (last-day-of-month) sentinel for `monthly` rules on
//! day 29-31 is resolved here before the expression ever reaches a
//! `cron::Schedule`.

use crate::model::RecurrenceKind;

/// Builds the six-field cron expression for a recurrence, per the day/hour
/// fields supplied by the caller. Returns `None` for `Custom`, which is
/// expressed as an interval rather than a cron string.
pub fn build(
    kind: RecurrenceKind,
    hour: u8,
    minute: u8,
    day_of_week: Option<u8>,
    day_of_month: Option<u8>,
    month: Option<u8>,
) -> Option<String> {
    match kind {
        RecurrenceKind::Daily => Some(format!("0 {minute} {hour} * * *")),
        RecurrenceKind::Weekly => {
            let dow = day_of_week.unwrap_or(0);
            Some(format!("0 {minute} {hour} * * {dow}"))
        }
        RecurrenceKind::Monthly => {
            let day = day_of_month.unwrap_or(1);
            let day_field = if day > 28 { "L".to_string() } else { day.to_string() };
            Some(format!("0 {minute} {hour} {day_field} * *"))
        }
        RecurrenceKind::Yearly | RecurrenceKind::Birthday => {
            let day = day_of_month.unwrap_or(1);
            let month = month.unwrap_or(1);
            Some(format!("0 {minute} {hour} {day} {month} *"))
        }
        RecurrenceKind::Custom => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_builds_minute_hour_wildcard() {
        assert_eq!(build(RecurrenceKind::Daily, 9, 30, None, None, None).unwrap(), "0 30 9 * * *");
    }

    #[test]
    fn weekly_appends_day_of_week() {
        assert_eq!(build(RecurrenceKind::Weekly, 9, 0, Some(3), None, None).unwrap(), "0 0 9 * * 3");
    }

    #[test]
    fn monthly_uses_last_day_sentinel_past_28() {
        assert_eq!(build(RecurrenceKind::Monthly, 9, 0, None, Some(30), None).unwrap(), "0 0 9 L * *");
    }

    #[test]
    fn monthly_keeps_numeric_day_at_or_below_28() {
        assert_eq!(build(RecurrenceKind::Monthly, 9, 0, None, Some(15), None).unwrap(), "0 0 9 15 * *");
    }

    #[test]
    fn yearly_includes_day_and_month() {
        assert_eq!(build(RecurrenceKind::Yearly, 9, 0, None, Some(25), Some(12)).unwrap(), "0 0 9 25 12 *");
    }

    #[test]
    fn custom_has_no_cron_representation() {
        assert!(build(RecurrenceKind::Custom, 9, 0, None, None, None).is_none());
    }
}
