//! Engineering-unit conversions used on the control plane.
//!
//! The wire protocol carries gains and levels in dB; internally the
//! demodulators work with voltage ratios and power ratios.

use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

/// GPS runs ahead of UTC by the accumulated leap seconds.
const GPS_UTC_OFFSET_NS: i64 = 18_000_000_000;

pub fn db2voltage(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

pub fn voltage2db(voltage: f32) -> f32 {
    20.0 * voltage.log10()
}

pub fn db2power(db: f32) -> f32 {
    10.0f32.powf(db / 10.0)
}

pub fn power2db(power: f32) -> f32 {
    10.0 * power.log10()
}

/// Nanoseconds since the GPS epoch, as carried in `GPS_TIME` status
/// options.
pub fn gps_time_ns() -> i64 {
    let unix_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    unix_ns + GPS_UTC_OFFSET_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trips() {
        for db in [-60.0f32, -6.0, 0.0, 3.0, 20.0] {
            assert!((voltage2db(db2voltage(db)) - db).abs() < 1e-4);
            assert!((power2db(db2power(db)) - db).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_db_is_unity() {
        assert_eq!(db2voltage(0.0), 1.0);
        assert_eq!(db2power(0.0), 1.0);
    }
}
