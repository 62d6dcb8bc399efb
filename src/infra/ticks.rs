//! 100-nanosecond ticks since 0001-01-01T00:00:00Z, the version unit used by
//! timestamp-backed sources.

use time::OffsetDateTime;

/// Ticks between 0001-01-01 and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

const NANOS_PER_TICK: i128 = 100;

pub fn from_datetime(value: OffsetDateTime) -> i64 {
    let ticks = value.unix_timestamp_nanos() / NANOS_PER_TICK;
    // Out-of-range values saturate; they only arise for timestamps past year 29000.
    i64::try_from(ticks)
        .unwrap_or(if ticks < 0 { i64::MIN } else { i64::MAX })
        .saturating_add(UNIX_EPOCH_TICKS)
}

/// `None` when `ticks` falls outside the range `time` can represent.
pub fn to_datetime(ticks: i64) -> Option<OffsetDateTime> {
    let nanos = i128::from(ticks.checked_sub(UNIX_EPOCH_TICKS)?) * NANOS_PER_TICK;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

pub fn now() -> i64 {
    from_datetime(OffsetDateTime::now_utc())
}
