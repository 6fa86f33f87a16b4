use time::OffsetDateTime;

pub fn utc_now_ms() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

/// Wall-clock time as a `(seconds, nanoseconds)` pair since the unix epoch.
pub fn utc_now_parts() -> (i64, i64) {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp(), i64::from(now.nanosecond()))
}
