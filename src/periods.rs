use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::{MonitoringError, Result};

/// Floor `timestamp` onto the grid of `interval`-long buckets counted from the
/// Unix epoch.
///
/// The grid is fixed, so every caller using the same interval sees the same
/// bucket boundaries, and aligning an aligned value returns it unchanged.
///
/// # Arguments
/// * `timestamp` - Any point in time
/// * `interval` - Bucket length, must be strictly positive
///
/// # Returns
/// Start of the bucket containing `timestamp`
pub fn align_period_start(timestamp: DateTime<Utc>, interval: Duration) -> Result<DateTime<Utc>> {
    let step = interval_millis(interval)?;
    let aligned = timestamp.timestamp_millis().div_euclid(step) * step;
    from_millis(aligned)
}

/// Enumerate contiguous `(bucket_start, bucket_end)` pairs starting at the
/// aligned `start` and continuing while `bucket_start < end`.
///
/// The last bucket may extend past `end`. An empty range yields nothing.
pub fn generate_periods(
    start: DateTime<Utc>,
    interval: Duration,
    end: DateTime<Utc>,
) -> Result<Periods> {
    let step = interval_millis(interval)?;
    let first = align_period_start(start, interval)?.timestamp_millis();
    let end = if end <= start {
        first
    } else {
        end.timestamp_millis()
    };

    Ok(Periods {
        next_start: first,
        step,
        end,
    })
}

/// Lazy bucket sequence produced by [`generate_periods`].
#[derive(Debug, Clone)]
pub struct Periods {
    next_start: i64,
    step: i64,
    end: i64,
}

impl Iterator for Periods {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.end {
            return None;
        }
        let start = self.next_start;
        let stop = start.checked_add(self.step)?;
        self.next_start = stop;
        Some((from_millis(start).ok()?, from_millis(stop).ok()?))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.next_start >= self.end {
            return (0, Some(0));
        }
        let remaining = ((self.end - self.next_start) + self.step - 1) / self.step;
        (0, Some(remaining as usize))
    }
}

/// Interval length in milliseconds, rejecting zero and negative durations.
pub(crate) fn interval_millis(interval: Duration) -> Result<i64> {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return Err(MonitoringError::Configuration(format!(
            "interval must be a positive duration, got {}ms",
            step
        )));
    }
    Ok(step)
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| MonitoringError::Internal(format!("timestamp out of range: {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        let naive = NaiveDate::from_ymd_opt(2017, 6, 20)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap();
        Utc.from_utc_datetime(&naive)
    }

    #[test]
    fn test_time_periods() {
        let start = at(12, 22, 50);
        let start_aligned = at(12, 20, 0);
        let interval = Duration::minutes(5);
        let end = start + Duration::minutes(5) + Duration::seconds(22);

        assert_eq!(align_period_start(start, interval).unwrap(), start_aligned);

        let periods: Vec<_> = generate_periods(start, interval, end).unwrap().collect();
        assert_eq!(
            periods,
            vec![
                (start_aligned, start_aligned + interval),
                (start_aligned + interval, start_aligned + interval * 2),
            ]
        );
    }

    #[test]
    fn test_alignment_is_idempotent() {
        let intervals = [
            Duration::seconds(1),
            Duration::seconds(7),
            Duration::minutes(5),
            Duration::hours(1),
            Duration::days(1),
        ];
        let stamps = [at(0, 0, 0), at(12, 22, 50), at(23, 59, 59)];

        for interval in intervals {
            for ts in stamps {
                let aligned = align_period_start(ts, interval).unwrap();
                assert!(aligned <= ts);
                assert!(ts - aligned < interval);
                assert_eq!(align_period_start(aligned, interval).unwrap(), aligned);
            }
        }
    }

    #[test]
    fn test_periods_form_progression() {
        let interval = Duration::minutes(3);
        let start = at(8, 1, 13);
        let end = start + interval * 5 + Duration::seconds(40);

        let periods: Vec<_> = generate_periods(start, interval, end).unwrap().collect();
        let first = align_period_start(start, interval).unwrap();

        assert_eq!(periods.first().map(|p| p.0), Some(first));
        for (idx, (bucket_start, bucket_end)) in periods.iter().enumerate() {
            assert_eq!(*bucket_start, first + interval * idx as i32);
            assert_eq!(*bucket_end - *bucket_start, interval);
        }
        let (_, last_end) = periods.last().copied().unwrap();
        assert!(last_end >= end);
        assert!(last_end - interval < end);
    }

    #[test]
    fn test_periods_are_restartable() {
        let periods = generate_periods(at(1, 0, 0), Duration::minutes(10), at(2, 0, 0)).unwrap();
        let again = periods.clone();
        assert_eq!(periods.count(), 6);
        assert_eq!(again.count(), 6);
    }

    #[test]
    fn test_edge_cases() {
        assert!(matches!(
            align_period_start(at(1, 0, 0), Duration::zero()),
            Err(MonitoringError::Configuration(_))
        ));
        assert!(matches!(
            generate_periods(at(1, 0, 0), Duration::seconds(-5), at(2, 0, 0)),
            Err(MonitoringError::Configuration(_))
        ));

        let empty = generate_periods(at(2, 0, 0), Duration::minutes(5), at(1, 0, 0)).unwrap();
        assert_eq!(empty.count(), 0);
        let same = generate_periods(at(2, 0, 0), Duration::minutes(5), at(2, 0, 0)).unwrap();
        assert_eq!(same.count(), 0);
    }
}
