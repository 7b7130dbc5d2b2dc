use std::collections::HashMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{Config, ReadPolicy};
use crate::constants::STATION_DEDUP_DECIMALS;
use crate::error::StoreError;
use crate::storage::{parse_lenient_json, read_text_tolerant};
use crate::types::StationPoint;
use crate::utils::{hours_between, parse_timestamp_utc};

const LAT_KEYS: [&str; 3] = ["lat", "latitude", "y"];
const LON_KEYS: [&str; 5] = ["lon", "lng", "long", "longitude", "x"];
const VALUE_KEYS: [&str; 7] = [
    "value",
    "val",
    "rawconcentration",
    "concentration",
    "measurement",
    "v",
    "avg",
];
const TIME_KEYS: [&str; 7] = [
    "ts",
    "timestamp",
    "time",
    "datetime",
    "date_utc",
    "utc",
    "observed_at",
];
const PROVIDER_KEYS: [&str; 3] = ["provider", "source", "network"];
const UNIT_KEYS: [&str; 3] = ["units", "unit", "uom"];
const ROW_CONTAINER_KEYS: [&str; 5] = ["data", "records", "results", "items", "stations"];
const PREFERRED_PROVIDER: &str = "airnow";

#[derive(Debug)]
pub enum StationPayload {
    RowArray(Vec<Value>),
    RowDict(Map<String, Value>),
    GeoJsonFeatureCollection(Vec<Value>),
    NdjsonOrCsv(String),
    SingleRecord(Map<String, Value>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StationRecord {
    pub lat: f64,
    pub lon: f64,
    pub val: f64,
    pub ts: Option<String>,
    pub provider: Option<String>,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StationSet {
    pub points: Vec<StationPoint>,
    pub unit: Option<String>,
    pub snapshot: Option<String>,
}

impl StationPayload {
    pub fn sniff(text: &str) -> Self {
        match parse_lenient_json(text) {
            Ok(Value::Array(rows)) => StationPayload::RowArray(rows),
            Ok(Value::Object(object)) => Self::classify_object(object),
            _ => StationPayload::NdjsonOrCsv(text.to_string()),
        }
    }

    fn classify_object(object: Map<String, Value>) -> Self {
        let is_collection = object.get("type").and_then(Value::as_str) == Some("FeatureCollection");
        if is_collection || object.get("features").map(Value::is_array).unwrap_or(false) {
            let features = match object.get("features") {
                Some(Value::Array(features)) => features.clone(),
                _ => Vec::new(),
            };
            return StationPayload::GeoJsonFeatureCollection(features);
        }
        if lookup(&object, &LAT_KEYS).is_some() && lookup(&object, &LON_KEYS).is_some() {
            return StationPayload::SingleRecord(object);
        }
        for key in ROW_CONTAINER_KEYS {
            if let Some(Value::Array(rows)) = object.get(key) {
                return StationPayload::RowArray(rows.clone());
            }
        }
        StationPayload::RowDict(object)
    }

    pub fn records(self) -> Vec<StationRecord> {
        match self {
            StationPayload::RowArray(rows) => rows
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|row| extract_record(row, None))
                .collect(),
            StationPayload::RowDict(object) => object
                .values()
                .filter_map(Value::as_object)
                .filter_map(|row| extract_record(row, None))
                .collect(),
            StationPayload::GeoJsonFeatureCollection(features) => features
                .iter()
                .filter_map(feature_record)
                .collect(),
            StationPayload::NdjsonOrCsv(text) => text_records(&text),
            StationPayload::SingleRecord(object) => {
                extract_record(&object, None).into_iter().collect()
            }
        }
    }
}

fn extract_record(row: &Map<String, Value>, coords: Option<(f64, f64)>) -> Option<StationRecord> {
    let (lat, lon) = match coords {
        Some(coords) => coords,
        None => (
            lookup(row, &LAT_KEYS).and_then(as_number)?,
            lookup(row, &LON_KEYS).and_then(as_number)?,
        ),
    };
    let val = lookup(row, &VALUE_KEYS).and_then(as_number)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) || !val.is_finite() {
        return None;
    }
    Some(StationRecord {
        lat,
        lon,
        val,
        ts: lookup(row, &TIME_KEYS).and_then(as_text),
        provider: lookup(row, &PROVIDER_KEYS).and_then(as_text),
        unit: lookup(row, &UNIT_KEYS).and_then(as_text),
    })
}

fn feature_record(feature: &Value) -> Option<StationRecord> {
    let coordinates = feature.get("geometry")?.get("coordinates")?.as_array()?;
    let lon = coordinates.first().and_then(as_number)?;
    let lat = coordinates.get(1).and_then(as_number)?;
    let empty = Map::new();
    let properties = feature
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    extract_record(properties, Some((lat, lon)))
}

fn text_records(text: &str) -> Vec<StationRecord> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let Some(first) = lines.next() else {
        return Vec::new();
    };

    if first.starts_with('{') {
        return std::iter::once(first)
            .chain(lines)
            .filter_map(|line| match parse_lenient_json(line) {
                Ok(Value::Object(row)) => extract_record(&row, None),
                _ => None,
            })
            .collect();
    }

    let header: Vec<String> = split_csv_line(first);
    lines
        .filter_map(|line| {
            let row: Map<String, Value> = header
                .iter()
                .cloned()
                .zip(split_csv_line(line).into_iter().map(Value::String))
                .collect();
            extract_record(&row, None)
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in line.chars() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn lookup<'a>(row: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| {
        row.iter()
            .find(|(key, value)| key.eq_ignore_ascii_case(alias) && !value.is_null())
            .map(|(_, value)| value)
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Resolves ages, drops duplicates at the same rounded location (freshest wins, AirNow on ties)
/// and reports the most frequent unit.
pub fn normalize_records(
    records: Vec<StationRecord>,
    snapshot_hour: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (Vec<StationPoint>, Option<String>) {
    let fallback_age = hours_between(snapshot_hour, now).max(0.0);
    let scale = 10f64.powi(STATION_DEDUP_DECIMALS);
    let mut unit_counts: HashMap<String, usize> = HashMap::new();
    let mut best: HashMap<(i64, i64), StationPoint> = HashMap::new();
    let mut order: Vec<(i64, i64)> = Vec::new();

    for record in records {
        if let Some(unit) = record.unit.as_ref() {
            *unit_counts.entry(unit.clone()).or_default() += 1;
        }
        let age_h = record
            .ts
            .as_deref()
            .and_then(parse_timestamp_utc)
            .map(|ts| hours_between(ts, now).max(0.0))
            .unwrap_or(fallback_age);
        let point = StationPoint {
            lat: record.lat,
            lon: record.lon,
            val: record.val,
            age_h,
            provider: record.provider,
        };
        let key = (
            (record.lat * scale).round() as i64,
            (record.lon * scale).round() as i64,
        );
        match best.get(&key) {
            None => {
                order.push(key);
                best.insert(key, point);
            }
            Some(current) if prefer(&point, current) => {
                best.insert(key, point);
            }
            Some(_) => {}
        }
    }

    let unit = unit_counts
        .into_iter()
        .max_by(|left, right| left.1.cmp(&right.1).then_with(|| right.0.cmp(&left.0)))
        .map(|(unit, _)| unit);
    let points = order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .collect();
    (points, unit)
}

fn prefer(candidate: &StationPoint, current: &StationPoint) -> bool {
    if (candidate.age_h - current.age_h).abs() > 1e-9 {
        return candidate.age_h < current.age_h;
    }
    let is_preferred = |point: &StationPoint| {
        point
            .provider
            .as_deref()
            .map(|provider| provider.eq_ignore_ascii_case(PREFERRED_PROVIDER))
            .unwrap_or(false)
    };
    is_preferred(candidate) && !is_preferred(current)
}

pub struct StationStore<'a> {
    cfg: &'a Config,
    policy: ReadPolicy,
}

impl<'a> StationStore<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self {
            cfg,
            policy: cfg.read_policy,
        }
    }

    pub fn load_recent(&self, param: &str, now: DateTime<Utc>, max_age_h: f64) -> StationSet {
        let dir = self.cfg.station_hours_dir(param);
        let lookback = max_age_h.max(0.0).ceil() as i64 + 1;
        let current_hour = now
            .with_minute(0)
            .and_then(|ts| ts.with_second(0))
            .and_then(|ts| ts.with_nanosecond(0))
            .unwrap_or(now);

        for step in 0..lookback {
            let hour = current_hour - Duration::hours(step);
            let file_name = hour.format("%Y-%m-%dT%H.json").to_string();
            let path = dir.join(&file_name);
            let text = match read_text_tolerant(&path, self.policy) {
                Ok((text, _)) => text,
                Err(StoreError::NotFound(_)) => continue,
                Err(error) => {
                    warn!("Skipping station snapshot {}: {error}", path.display());
                    continue;
                }
            };

            let records = StationPayload::sniff(&text).records();
            let (points, unit) = normalize_records(records, hour, now);
            if points.is_empty() {
                debug!("Station snapshot {} normalized to zero points", path.display());
                continue;
            }
            return StationSet {
                points,
                unit,
                snapshot: Some(file_name),
            };
        }

        StationSet::default()
    }
}
