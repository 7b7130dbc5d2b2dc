use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::thread::sleep;

use flate2::read::GzDecoder;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Config, ReadPolicy};
use crate::constants::HOURS_PER_DAY;
use crate::error::StoreError;
use crate::types::{Bbox, GridGeometry, Product, ValueGrid};
use crate::utils::{parse_timestamp_utc, system_time_ms};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const UTF8_BOM: &str = "\u{feff}";

#[derive(Clone, Debug)]
pub struct BaseSnapshot {
    pub geometry: GridGeometry,
    pub unit: String,
    pub value: ValueGrid,
    pub age_h: ValueGrid,
    pub cloud: Option<ValueGrid>,
    pub generated_at: Option<String>,
    pub modified_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct BaseHeader {
    pub geometry: GridGeometry,
    pub unit: String,
    pub generated_at: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HodClimatology {
    pub slices: Vec<ValueGrid>,
    pub newest_gid: Option<String>,
    pub missing_hours: Vec<usize>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HodMeta {
    pub newest_gid: Option<String>,
    pub newest_end: Option<String>,
    pub hour_counts: Vec<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GranuleEntry {
    pub gid: String,
    pub file: String,
    pub t0: Option<String>,
    pub t1: Option<String>,
    pub saved: Option<String>,
    pub bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct MeteoIndex {
    pub latest_run: String,
    pub hours: Vec<u32>,
    pub source: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MeteoField {
    pub run_id: String,
    pub bbox: Bbox,
    pub height: usize,
    pub width: usize,
    pub valid_time: Option<String>,
    pub u10: Option<ValueGrid>,
    pub v10: Option<ValueGrid>,
    pub blh: Option<ValueGrid>,
}

pub struct GridStore<'a> {
    cfg: &'a Config,
    policy: ReadPolicy,
}

impl<'a> GridStore<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self {
            cfg,
            policy: cfg.read_policy,
        }
    }

    pub fn load_base(&self, product: Product) -> Result<BaseSnapshot, StoreError> {
        let path = self.cfg.fc_support_dir(product).join("latest.json");
        let (json, resolved) = read_json_tolerant(&path, self.policy)?;
        let geometry = parse_geometry(&json, &path)?;
        let data = json
            .get("data")
            .ok_or_else(|| StoreError::malformed(&path, "missing 'data'"))?;
        let value = data
            .get("value")
            .ok_or_else(|| StoreError::malformed(&path, "missing 'data.value'"))
            .and_then(|node| parse_grid(node, &path, &geometry))?;
        let age_h = match data.get("age_h") {
            Some(node) => parse_grid(node, &path, &geometry)?,
            None => {
                warn!("{} has no data.age_h; treating every cell as observed now", path.display());
                ValueGrid::nan(geometry.height, geometry.width)
            }
        };
        let cloud = match data.get("cloud") {
            Some(Value::Null) | None => None,
            Some(node) => Some(parse_grid(node, &path, &geometry)?),
        };

        Ok(BaseSnapshot {
            geometry,
            unit: string_field(&json, "unit").unwrap_or_else(|| product.spec().unit.to_string()),
            value,
            age_h,
            cloud,
            generated_at: string_field(&json, "generated_at"),
            modified_ms: modified_ms(&resolved),
        })
    }

    pub fn load_base_header(&self, product: Product) -> Result<BaseHeader, StoreError> {
        let path = self.cfg.fc_support_dir(product).join("latest.json");
        let (json, _) = read_json_tolerant(&path, self.policy)?;
        Ok(BaseHeader {
            geometry: parse_geometry(&json, &path)?,
            unit: string_field(&json, "unit").unwrap_or_else(|| product.spec().unit.to_string()),
            generated_at: string_field(&json, "generated_at"),
        })
    }

    pub fn hod_slice_count(&self, product: Product) -> usize {
        let dir = self.cfg.hod_dir(product);
        (0..HOURS_PER_DAY)
            .filter(|hour| resolve_existing(&dir.join(format!("hour_{hour:02}.json"))).is_some())
            .count()
    }

    pub fn latest_modified_ms(&self, product: Product) -> Option<i64> {
        let path = self.cfg.fc_support_dir(product).join("latest.json");
        resolve_existing(&path).and_then(|resolved| modified_ms(&resolved))
    }

    pub fn load_hod(
        &self,
        product: Product,
        geometry: &GridGeometry,
    ) -> Result<HodClimatology, StoreError> {
        let dir = self.cfg.hod_dir(product);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(dir));
        }

        let mut slices = Vec::with_capacity(HOURS_PER_DAY);
        let mut missing_hours = Vec::new();
        for hour in 0..HOURS_PER_DAY {
            let path = dir.join(format!("hour_{hour:02}.json"));
            match read_json_tolerant(&path, self.policy) {
                Ok((json, _)) => {
                    let node = json
                        .get("data")
                        .ok_or_else(|| StoreError::malformed(&path, "missing 'data'"))?;
                    slices.push(parse_grid(node, &path, geometry)?);
                }
                Err(StoreError::NotFound(_)) => {
                    missing_hours.push(hour);
                    slices.push(ValueGrid::nan(geometry.height, geometry.width));
                }
                Err(error) => return Err(error),
            }
        }
        if !missing_hours.is_empty() {
            warn!(
                "{}: HOD slices missing for hours {:?}; ratios fall back to 1 there",
                product, missing_hours
            );
        }

        Ok(HodClimatology {
            slices,
            newest_gid: self.load_hod_meta(product).newest_gid,
            missing_hours,
        })
    }

    pub fn load_hod_meta(&self, product: Product) -> HodMeta {
        let path = self.cfg.hod_dir(product).join("meta.json");
        match read_json_tolerant(&path, self.policy) {
            Ok((json, _)) => HodMeta {
                newest_gid: string_field(&json, "newest_gid"),
                newest_end: string_field(&json, "newest_end"),
                hour_counts: json
                    .get("hour_counts")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(Value::as_u64).collect())
                    .unwrap_or_default(),
            },
            Err(error) => {
                debug!("No HOD meta for {product}: {error}");
                HodMeta::default()
            }
        }
    }

    pub fn load_granule_index(&self, product: Product) -> Result<Vec<GranuleEntry>, StoreError> {
        let path = self.cfg.granule_dir(product).join("index.json");
        let (json, _) = read_json_tolerant(&path, self.policy)?;
        let object = json
            .as_object()
            .ok_or_else(|| StoreError::malformed(&path, "index is not an object"))?;

        let mut entries: Vec<GranuleEntry> = object
            .iter()
            .filter_map(|(gid, meta)| {
                let meta = meta.as_object()?;
                let field = |name: &str| meta.get(name).and_then(Value::as_str).map(str::to_string);
                Some(GranuleEntry {
                    gid: gid.clone(),
                    file: field("file").unwrap_or_else(|| format!("{product}_{gid}.json")),
                    t0: field("t0"),
                    t1: field("t1").or_else(|| field("end")),
                    saved: field("saved"),
                    bytes: meta.get("bytes").and_then(Value::as_u64),
                })
            })
            .collect();

        entries.sort_by_key(|entry| {
            std::cmp::Reverse(
                entry
                    .t1
                    .as_deref()
                    .and_then(parse_timestamp_utc)
                    .map(|ts| ts.timestamp())
                    .unwrap_or(i64::MIN),
            )
        });
        Ok(entries)
    }

    pub fn load_granule(&self, product: Product, gid: &str) -> Result<BaseSnapshot, StoreError> {
        let dir = self.cfg.granule_dir(product);
        if !is_safe_gid(gid) {
            return Err(StoreError::NotFound(dir.join(gid)));
        }
        let file = self
            .load_granule_index(product)
            .ok()
            .and_then(|entries| entries.into_iter().find(|entry| entry.gid == gid))
            .map(|entry| entry.file)
            .unwrap_or_else(|| format!("{product}_{gid}.json"));
        let file_name = Path::new(&file)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or(file);
        let path = dir.join(file_name);

        let (json, resolved) = read_json_tolerant(&path, self.policy)?;
        let geometry = parse_geometry(&json, &path)?;
        let node = json
            .get("data")
            .ok_or_else(|| StoreError::malformed(&path, "missing 'data'"))?;
        let value = match node.get("value") {
            Some(inner) => parse_grid(inner, &path, &geometry)?,
            None => parse_grid(node, &path, &geometry)?,
        };

        Ok(BaseSnapshot {
            geometry,
            unit: string_field(&json, "unit").unwrap_or_else(|| product.spec().unit.to_string()),
            age_h: ValueGrid::filled(geometry.height, geometry.width, 0.0),
            value,
            cloud: None,
            generated_at: string_field(&json, "issued_at"),
            modified_ms: modified_ms(&resolved),
        })
    }

    pub fn load_meteo_index(&self) -> Result<MeteoIndex, StoreError> {
        let path = self.cfg.meteo_dir().join("index.json");
        let (json, _) = read_json_tolerant(&path, self.policy)?;
        let latest_run = string_field(&json, "latest_run")
            .ok_or_else(|| StoreError::malformed(&path, "missing 'latest_run'"))?;
        Ok(MeteoIndex {
            latest_run,
            hours: json
                .get("hours")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_u64)
                        .map(|hour| hour as u32)
                        .collect()
                })
                .unwrap_or_default(),
            source: string_field(&json, "source"),
        })
    }

    pub fn load_meteo(&self, hour_offset: u32) -> Result<MeteoField, StoreError> {
        let index = self.load_meteo_index()?;
        let path = self
            .cfg
            .meteo_dir()
            .join(&index.latest_run)
            .join(format!("+{hour_offset}h.json"));
        let (json, _) = read_json_tolerant(&path, self.policy)?;

        let bbox = json
            .get("bbox")
            .and_then(number_list)
            .and_then(|values| Bbox::from_slice(&values))
            .ok_or_else(|| StoreError::malformed(&path, "missing or invalid 'bbox'"))?;
        let (height, width) = parse_shape(&json)
            .ok_or_else(|| StoreError::malformed(&path, "missing or invalid 'shape'"))?;

        let variable = |name: &str| -> Option<ValueGrid> {
            let grid = json.get(name).and_then(grid_from_value)?;
            if grid.height != height || grid.width != width {
                warn!(
                    "{}: '{}' is {}x{}, declared shape {}x{}; ignoring it",
                    path.display(),
                    name,
                    grid.height,
                    grid.width,
                    height,
                    width
                );
                return None;
            }
            Some(grid)
        };

        Ok(MeteoField {
            run_id: index.latest_run.clone(),
            bbox,
            height,
            width,
            valid_time: string_field(&json, "valid_time"),
            u10: variable("u10"),
            v10: variable("v10"),
            blh: variable("blh"),
        })
    }
}

pub fn is_safe_gid(gid: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_.:\-]{1,160}$")
        .map(|regex| regex.is_match(gid) && !gid.contains(".."))
        .unwrap_or(false)
}

pub fn read_json_tolerant(path: &Path, policy: ReadPolicy) -> Result<(Value, PathBuf), StoreError> {
    let resolved = resolve_existing(path).ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match read_once(&resolved) {
            Ok(value) => return Ok((value, resolved)),
            Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(error) => {
                debug!(
                    "Read attempt {attempt}/{attempts} of {} failed: {error}",
                    resolved.display()
                );
                last_error = Some(error);
            }
        }
        if attempt < attempts {
            sleep(policy.retry_delay);
        }
    }

    Err(last_error.unwrap_or_else(|| StoreError::NotFound(path.to_path_buf())))
}

pub fn read_text_tolerant(path: &Path, policy: ReadPolicy) -> Result<(String, PathBuf), StoreError> {
    let resolved = resolve_existing(path).ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let outcome = fs::read(&resolved)
            .map_err(|source| StoreError::Io {
                path: resolved.clone(),
                source,
            })
            .and_then(|bytes| {
                let text = decode_text(&bytes)
                    .map_err(|reason| StoreError::malformed(&resolved, reason))?;
                if text.trim().is_empty() {
                    return Err(StoreError::malformed(&resolved, "empty file"));
                }
                Ok(text)
            });
        match outcome {
            Ok(text) => return Ok((text, resolved)),
            Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(error) => last_error = Some(error),
        }
        if attempt < attempts {
            sleep(policy.retry_delay);
        }
    }

    Err(last_error.unwrap_or_else(|| StoreError::NotFound(path.to_path_buf())))
}

fn resolve_existing(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    let gz = PathBuf::from(gz);
    gz.is_file().then_some(gz)
}

fn read_once(path: &Path) -> Result<Value, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(StoreError::malformed(path, "empty file"));
    }
    let text = decode_text(&bytes).map_err(|reason| StoreError::malformed(path, reason))?;
    parse_lenient_json(&text).map_err(|error| StoreError::malformed(path, error.to_string()))
}

pub fn decode_text(bytes: &[u8]) -> Result<String, String> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|error| format!("gzip decode failed: {error}"))?;
        return Ok(text);
    }
    String::from_utf8(bytes.to_vec()).map_err(|error| format!("invalid UTF-8: {error}"))
}

pub fn parse_lenient_json(text: &str) -> serde_json::Result<Value> {
    serde_json::from_str(&sanitize_json_text(text))
}

/// Strips a BOM, turns `NaN`/`Infinity`/`-Infinity` into `null` and drops trailing commas.
/// String literals are left untouched.
pub fn sanitize_json_text(text: &str) -> String {
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(text);
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        if in_string {
            out.push(byte);
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        let rest = &bytes[index..];
        if byte == b'"' {
            in_string = true;
            out.push(byte);
            index += 1;
        } else if rest.starts_with(b"-Infinity") || rest.starts_with(b"+Infinity") {
            out.extend_from_slice(b"null");
            index += 9;
        } else if rest.starts_with(b"Infinity") {
            out.extend_from_slice(b"null");
            index += 8;
        } else if rest.starts_with(b"NaN") {
            out.extend_from_slice(b"null");
            index += 3;
        } else if byte == b',' {
            let next = rest[1..]
                .iter()
                .find(|candidate| !candidate.is_ascii_whitespace());
            if !matches!(next, Some(b'}') | Some(b']')) {
                out.push(byte);
            }
            index += 1;
        } else {
            out.push(byte);
            index += 1;
        }
    }

    // Only ASCII bytes were replaced or removed, so the buffer is still UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

fn parse_geometry(json: &Value, path: &Path) -> Result<GridGeometry, StoreError> {
    let bbox = json
        .get("bbox")
        .and_then(number_list)
        .and_then(|values| Bbox::from_slice(&values))
        .ok_or_else(|| StoreError::malformed(path, "missing or invalid 'bbox'"))?;
    let (height, width) = match parse_shape(json) {
        Some(shape) => shape,
        None => infer_shape(json)
            .ok_or_else(|| StoreError::malformed(path, "missing or invalid 'shape'"))?,
    };
    if height == 0 || width == 0 {
        return Err(StoreError::malformed(path, "empty grid shape"));
    }
    let grid_deg = json
        .get("grid_deg")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or_else(|| {
            if width > 1 {
                (bbox.east - bbox.west) / (width - 1) as f64
            } else {
                0.0
            }
        });

    Ok(GridGeometry {
        bbox,
        height,
        width,
        grid_deg,
    })
}

fn parse_shape(json: &Value) -> Option<(usize, usize)> {
    let shape = json.get("shape")?.as_array()?;
    if shape.len() != 2 {
        return None;
    }
    let height = shape[0].as_u64()? as usize;
    let width = shape[1].as_u64()? as usize;
    Some((height, width))
}

fn infer_shape(json: &Value) -> Option<(usize, usize)> {
    let data = json.get("data")?;
    let grid = grid_from_value(data.get("value").unwrap_or(data))?;
    Some((grid.height, grid.width))
}

fn parse_grid(node: &Value, path: &Path, geometry: &GridGeometry) -> Result<ValueGrid, StoreError> {
    let grid = grid_from_value(node)
        .ok_or_else(|| StoreError::malformed(path, "grid is not a rectangular 2-D array"))?;
    if grid.height != geometry.height || grid.width != geometry.width {
        return Err(StoreError::ShapeMismatch {
            path: path.to_path_buf(),
            expected: (geometry.height, geometry.width),
            found: (grid.height, grid.width),
        });
    }
    Ok(grid)
}

pub fn grid_from_value(node: &Value) -> Option<ValueGrid> {
    let rows = node.as_array()?;
    let parsed: Option<Vec<Vec<f64>>> = rows
        .iter()
        .map(|row| {
            row.as_array().map(|cells| {
                cells
                    .iter()
                    .map(|cell| cell.as_f64().unwrap_or(f64::NAN))
                    .collect()
            })
        })
        .collect();
    ValueGrid::from_rows(parsed?)
}

fn number_list(node: &Value) -> Option<Vec<f64>> {
    node.as_array()?.iter().map(Value::as_f64).collect()
}

fn string_field(json: &Value, name: &str) -> Option<String> {
    json.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn modified_ms(path: &Path) -> Option<i64> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(system_time_ms)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;
    use std::path::Path;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::{json, Value};

    pub fn write_json(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
    }

    pub fn write_gz(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        std::fs::write(path, encoder.finish().unwrap()).unwrap();
    }

    pub fn latest_json(value: Value, age: Value) -> Value {
        json!({
            "product": "no2",
            "unit": "molec/cm^2",
            "grid_deg": 1.0,
            "bbox": [0.0, 1.0, 0.0, 1.0],
            "shape": [2, 2],
            "data": {"value": value, "age_h": age}
        })
    }
}
