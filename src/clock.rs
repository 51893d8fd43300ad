//! Wall-clock access and calendar arithmetic in the site's timezone.
//!
//! All scheduling code works on epoch seconds; day and slot boundaries are
//! derived here so that daylight-saving transitions are handled in one place.

use chrono::{Datelike, Days, NaiveDate, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Current time as epoch seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn local_date(tz: &Tz, epoch: i64) -> Option<NaiveDate> {
    tz.timestamp_opt(epoch, 0).single().map(|dt| dt.date_naive())
}

fn local_instant(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<i64> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Epoch second of local midnight starting the day that contains `epoch`.
pub fn start_of_day(tz: &Tz, epoch: i64) -> i64 {
    local_date(tz, epoch)
        .and_then(|d| local_instant(tz, d, NaiveTime::MIN))
        .unwrap_or(epoch - epoch.rem_euclid(86_400))
}

/// Epoch second of the local midnight following `epoch`.
pub fn start_of_next_day(tz: &Tz, epoch: i64) -> i64 {
    local_date(tz, epoch)
        .and_then(|d| d.checked_add_days(Days::new(1)))
        .and_then(|d| local_instant(tz, d, NaiveTime::MIN))
        .unwrap_or(start_of_day(tz, epoch) + 86_400)
}

/// Next occurrence of the local wall-clock `time` strictly after `epoch`.
pub fn next_local_time(tz: &Tz, epoch: i64, time: NaiveTime) -> i64 {
    let Some(today) = local_date(tz, epoch) else {
        return epoch + 86_400;
    };
    let candidate = local_instant(tz, today, time);
    match candidate {
        Some(t) if t > epoch => t,
        _ => today
            .checked_add_days(Days::new(1))
            .and_then(|d| local_instant(tz, d, time))
            .unwrap_or(epoch + 86_400),
    }
}

/// Start of the slot containing `epoch`. Slots are aligned to the local hour.
pub fn slot_start(tz: &Tz, epoch: i64, slot_length: i64) -> i64 {
    match tz.timestamp_opt(epoch, 0).single() {
        Some(dt) => {
            let into_hour = (dt.minute() * 60 + dt.second()) as i64;
            epoch - into_hour % slot_length
        }
        None => epoch - epoch.rem_euclid(slot_length),
    }
}

/// `epoch` if it is a slot start, otherwise the start of the next slot.
pub fn ceil_to_slot(tz: &Tz, epoch: i64, slot_length: i64) -> i64 {
    let floor = slot_start(tz, epoch, slot_length);
    if floor == epoch {
        epoch
    } else {
        floor + slot_length
    }
}

/// Local calendar day number, used to tell whether two instants share a day.
pub fn day_ordinal(tz: &Tz, epoch: i64) -> i32 {
    local_date(tz, epoch).map(|d| d.num_days_from_ce()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;
    use chrono_tz::UTC;

    // 2024-03-30T12:00:00Z, the day before the spring DST switch in Berlin.
    const SPRING: i64 = 1_711_800_000;

    #[test]
    fn test_day_boundaries_utc() {
        let t = 1_700_000_000; // 2023-11-14T22:13:20Z
        assert_eq!(start_of_day(&UTC, t), 1_699_920_000);
        assert_eq!(start_of_next_day(&UTC, t), 1_700_006_400);
    }

    #[test]
    fn test_short_day_on_dst_switch() {
        let next = start_of_next_day(&Berlin, SPRING);
        let after = start_of_next_day(&Berlin, next);
        assert_eq!(after - next, 23 * 3600);
    }

    #[test]
    fn test_slot_alignment() {
        let t = 1_700_000_000; // 22:13:20 UTC
        assert_eq!(slot_start(&UTC, t, 900), 1_699_999_200);
        assert_eq!(ceil_to_slot(&UTC, t, 900), slot_start(&UTC, t, 900) + 900);
        let aligned = slot_start(&UTC, t, 900);
        assert_eq!(ceil_to_slot(&UTC, aligned, 900), aligned);
    }

    #[test]
    fn test_next_local_time_rolls_over() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let midnight = start_of_day(&UTC, 1_700_000_000);
        assert_eq!(next_local_time(&UTC, midnight, nine), midnight + 9 * 3600);
        assert_eq!(
            next_local_time(&UTC, midnight + 9 * 3600, nine),
            midnight + 33 * 3600
        );
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(20);
        assert_eq!(clock.now(), 120);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }
}
