//! NMEA GGA sentences used as the position keep-alive towards a caster.

use chrono::{NaiveTime, Timelike, Utc};

/// XOR of every byte of `body`, i.e. everything between `$` and `*`.
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Splits an absolute angle into whole degrees and decimal minutes,
/// carrying a minute value that rounds up to 60.
fn degrees_minutes(angle: f64) -> (u32, f64) {
    let angle = angle.abs();
    let mut degrees = angle.trunc() as u32;
    let mut minutes = ((angle - angle.trunc()) * 60.0 * 1e5).round() / 1e5;
    if minutes >= 60.0 {
        degrees += 1;
        minutes -= 60.0;
    }
    (degrees, minutes)
}

fn format_time(time: NaiveTime) -> String {
    let hundredths = (time.nanosecond() / 10_000_000).min(99);
    format!(
        "{:02}{:02}{:02}.{:02}",
        time.hour(),
        time.minute(),
        time.second(),
        hundredths
    )
}

/// Builds a `$GPGGA` sentence for a fixed position at the given UTC time.
///
/// Fix quality is always 1 with 8 satellites and an HDOP of 0.75.
pub fn create_gga_string_at(latitude: f64, longitude: f64, height: f64, time: NaiveTime) -> String {
    let (lat_deg, lat_min) = degrees_minutes(latitude);
    let (lon_deg, lon_min) = degrees_minutes(longitude);
    let north_south = if latitude < 0.0 { 'S' } else { 'N' };
    let east_west = if longitude < 0.0 { 'W' } else { 'E' };

    let body = format!(
        "GPGGA,{},{:02}{:08.5},{},{:03}{:08.5},{},1,08,0.75,{:.2},M,0.00,M,",
        format_time(time),
        lat_deg,
        lat_min,
        north_south,
        lon_deg,
        lon_min,
        east_west,
        height
    );
    format!("${}*{:02X}\r\n", body, nmea_checksum(&body))
}

/// Same as [`create_gga_string_at`] stamped with the current UTC time.
pub fn create_gga_string(latitude: f64, longitude: f64, height: f64) -> String {
    create_gga_string_at(latitude, longitude, height, Utc::now().time())
}
