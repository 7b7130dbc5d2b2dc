use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::constants::{DEG_TO_RAD, EARTH_RADIUS_KM, KM_PER_DEGREE};

pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

pub fn clamp(value: f64, min_value: f64, max_value: f64) -> f64 {
    value.max(min_value).min(max_value)
}

pub fn planar_distance_km(lat: f64, lon: f64, other_lat: f64, other_lon: f64) -> f64 {
    let dx = KM_PER_DEGREE * (other_lon - lon) * (lat * DEG_TO_RAD).cos();
    let dy = KM_PER_DEGREE * (other_lat - lat);
    dx.hypot(dy)
}

pub fn haversine_km(lat: f64, lon: f64, other_lat: f64, other_lon: f64) -> f64 {
    let phi1 = lat * DEG_TO_RAD;
    let phi2 = other_lat * DEG_TO_RAD;
    let d_phi = (other_lat - lat) * DEG_TO_RAD;
    let d_lambda = (other_lon - lon) * DEG_TO_RAD;
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

pub fn parse_timestamp_utc(timestamp: &str) -> Option<DateTime<Utc>> {
    let trimmed = timestamp.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    let without_zone = trimmed.trim_end_matches('Z');
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_zone, format) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }
    // Hour-only stamps such as "2025-10-04T13Z".
    NaiveDateTime::parse_from_str(&format!("{without_zone}:00"), "%Y-%m-%dT%H:%M")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

pub fn iso_from_ms(timestamp_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms).map(|ts| ts.to_rfc3339())
}

pub fn system_time_ms(time: SystemTime) -> Option<i64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_millis() as i64)
}

pub fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 3_600_000.0
}
