use std::collections::HashMap;

use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::constants::{
    MAX_ZOOM, MIN_ZOOM, PALETTE_ALPHA, PALETTE_BINS, PALETTE_LOW_ALPHA, RASTER_BASE_WIDTH,
};
use crate::domain::normalize;
use crate::error::ApiError;
use crate::pipeline::PipelineOutput;
use crate::meteo::FactorStats;
use crate::types::{Bbox, DisplayDomain, DomainStrategy, GridCell, GridGeometry, Palette};

const VIRIDIS_STOPS: [[u8; 3]; 9] = [
    [68, 1, 84],
    [71, 44, 122],
    [59, 81, 139],
    [44, 113, 142],
    [33, 144, 141],
    [39, 173, 129],
    [92, 200, 99],
    [170, 220, 50],
    [253, 231, 37],
];
const GRAY_LOW: f64 = 24.0;
const GRAY_HIGH: f64 = 250.0;
const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

pub fn palette_table(palette: Palette, bins: usize) -> Vec<[u8; 4]> {
    let bins = bins.max(2);
    (0..bins)
        .map(|bin| {
            let t = bin as f64 / (bins - 1) as f64;
            let [r, g, b] = match palette {
                Palette::Viridis => interpolate_stops(&VIRIDIS_STOPS, t),
                Palette::Gray => {
                    let level = (GRAY_LOW + (GRAY_HIGH - GRAY_LOW) * t).round() as u8;
                    [level, level, level]
                }
            };
            let alpha = PALETTE_LOW_ALPHA.get(bin).copied().unwrap_or(PALETTE_ALPHA);
            [r, g, b, alpha]
        })
        .collect()
}

fn interpolate_stops(stops: &[[u8; 3]], t: f64) -> [u8; 3] {
    let scaled = t.clamp(0.0, 1.0) * (stops.len() - 1) as f64;
    let lower = (scaled.floor() as usize).min(stops.len() - 1);
    let upper = (lower + 1).min(stops.len() - 1);
    let frac = scaled - lower as f64;
    let mut out = [0u8; 3];
    for channel in 0..3 {
        let a = stops[lower][channel] as f64;
        let b = stops[upper][channel] as f64;
        out[channel] = (a + (b - a) * frac).round() as u8;
    }
    out
}

pub fn palette_bin(value: f64, domain: &DisplayDomain, bins: usize) -> usize {
    let top = bins.saturating_sub(1);
    ((normalize(value, domain) * top as f64).floor() as usize).min(top)
}

pub fn validate_zoom(zoom: u8) -> Result<u8, ApiError> {
    if (MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
        Ok(zoom)
    } else {
        Err(ApiError::BadRequest(format!(
            "Zoom must be between {MIN_ZOOM} and {MAX_ZOOM}."
        )))
    }
}

pub fn raster_size(zoom: u8, geometry: &GridGeometry) -> (u32, u32) {
    let level = zoom.clamp(MIN_ZOOM, 5) - MIN_ZOOM;
    let width = RASTER_BASE_WIDTH << level;
    let aspect = geometry.height as f64 / geometry.width.max(1) as f64;
    let height = ((width as f64 * aspect).round() as u32).max(1);
    (width, height)
}

pub fn rasterize(output: &PipelineOutput, palette: Palette, width: u32, height: u32) -> Vec<u8> {
    let table = palette_table(palette, PALETTE_BINS);
    let grid = &output.grid;
    let spec = &output.spec;
    let (src_h, src_w) = (grid.height, grid.width);
    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    if src_h == 0 || src_w == 0 {
        return pixels;
    }

    let columns: Vec<usize> = (0..width as usize)
        .map(|px| (px * src_w / width as usize).min(src_w - 1))
        .collect();
    for py in 0..height as usize {
        let from_top = (py * src_h / height as usize).min(src_h - 1);
        let row = src_h - 1 - from_top;
        let line = &mut pixels[py * width as usize * 4..(py + 1) * width as usize * 4];
        for (px, col) in columns.iter().enumerate() {
            let value = grid.get(row, *col);
            let rgba = if spec.is_valid(value) {
                table[palette_bin(value.clamp(0.0, spec.cap), &output.domain, PALETTE_BINS)]
            } else {
                TRANSPARENT
            };
            line[px * 4..px * 4 + 4].copy_from_slice(&rgba);
        }
    }
    pixels
}

pub fn encode_png(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|error| ApiError::Internal(format!("PNG header failed: {error}")))?;
        writer
            .write_image_data(pixels)
            .map_err(|error| ApiError::Internal(format!("PNG encode failed: {error}")))?;
        writer
            .finish()
            .map_err(|error| ApiError::Internal(format!("PNG finish failed: {error}")))?;
    }
    Ok(bytes)
}

#[derive(Clone, Debug)]
pub struct RenderedRaster {
    pub png: Vec<u8>,
    pub etag: String,
    pub last_modified: Option<String>,
    pub domain: String,
    pub fusion: String,
    pub meteo: String,
}

#[derive(Clone, Debug)]
pub struct RasterCacheEntry {
    expires_at_ms: i64,
    raster: RenderedRaster,
}

pub fn render_raster(
    output: &PipelineOutput,
    palette: Palette,
    zoom: u8,
) -> Result<RenderedRaster, ApiError> {
    let (width, height) = raster_size(zoom, &output.geometry);
    let pixels = rasterize(output, palette, width, height);
    let png = encode_png(&pixels, width, height)?;
    Ok(RenderedRaster {
        etag: etag_for(&png),
        last_modified: output.modified_ms.and_then(http_date_from_ms),
        domain: format!(
            "{}:{:e},{:e}",
            match output.domain.strategy {
                DomainStrategy::Auto => "auto",
                DomainStrategy::Fixed => "fixed",
            },
            output.domain.min,
            output.domain.max
        ),
        fusion: output.diagnostics.fusion.why.as_str().to_string(),
        meteo: meteo_summary(output),
        png,
    })
}

fn meteo_summary(output: &PipelineOutput) -> String {
    let Some(report) = output.diagnostics.meteo.as_ref() else {
        return "off".to_string();
    };
    let describe = |name: &str, stats: &Option<FactorStats>| {
        stats.as_ref().map(|stats| {
            if stats.applied {
                format!("{name}:applied")
            } else {
                format!("{name}:{}", stats.reason.as_deref().unwrap_or("skipped"))
            }
        })
    };
    let parts: Vec<String> = [describe("wind", &report.wind), describe("blh", &report.blh)]
        .into_iter()
        .flatten()
        .collect();
    if parts.is_empty() {
        "off".to_string()
    } else {
        parts.join(",")
    }
}

pub fn etag_for(bytes: &[u8]) -> String {
    format!("\"{:08x}-{:x}\"", crc32fast::hash(bytes), bytes.len())
}

pub fn http_date_from_ms(timestamp_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|ts| ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

pub fn etag_matches(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|candidate| candidate.trim().trim_start_matches("W/"))
        .any(|candidate| candidate == "*" || candidate == etag)
}

pub fn raster_headers(raster: &RenderedRaster, max_age_seconds: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age_seconds}")) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&raster.etag) {
        headers.insert(header::ETAG, value);
    }
    if let Some(value) = raster
        .last_modified
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    for (name, value) in [
        ("X-Grid-Domain", raster.domain.as_str()),
        ("X-Grid-Fusion", raster.fusion.as_str()),
        ("X-Grid-Meteo", raster.meteo.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    headers
}

pub async fn cached_raster(
    cache: &RwLock<HashMap<String, RasterCacheEntry>>,
    key: &str,
    now_ms: i64,
) -> Option<RenderedRaster> {
    cache
        .read()
        .await
        .get(key)
        .filter(|entry| entry.expires_at_ms > now_ms)
        .map(|entry| entry.raster.clone())
}

pub async fn store_raster(
    cache: &RwLock<HashMap<String, RasterCacheEntry>>,
    key: String,
    raster: RenderedRaster,
    now_ms: i64,
    ttl_ms: i64,
    max_entries: usize,
) {
    if max_entries == 0 || ttl_ms <= 0 {
        return;
    }
    let mut cache = cache.write().await;
    cache.retain(|_, entry| entry.expires_at_ms > now_ms);
    while cache.len() >= max_entries {
        let Some(oldest) = cache
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at_ms)
            .map(|(key, _)| key.clone())
        else {
            break;
        };
        cache.remove(&oldest);
    }
    cache.insert(
        key,
        RasterCacheEntry {
            expires_at_ms: now_ms + ttl_ms,
            raster,
        },
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellWindow {
    pub row_lo: usize,
    pub row_hi: usize,
    pub col_lo: usize,
    pub col_hi: usize,
}

impl CellWindow {
    pub fn cell_count(&self) -> usize {
        (self.row_hi + 1 - self.row_lo) * (self.col_hi + 1 - self.col_lo)
    }
}

fn axis_range(lo: f64, hi: f64, origin: f64, step: f64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    if step <= 0.0 || len == 1 {
        return (lo <= origin && origin <= hi).then_some((0, 0));
    }
    let tolerance = 1e-9;
    let first = ((lo - origin) / step - tolerance).ceil().max(0.0);
    let last = ((hi - origin) / step + tolerance).floor();
    if last < first || last < 0.0 {
        return None;
    }
    let first = first as usize;
    let last = (last as usize).min(len - 1);
    (first <= last).then_some((first, last))
}

pub fn cell_window(geometry: &GridGeometry, bbox: &Bbox) -> Option<CellWindow> {
    let (row_lo, row_hi) = axis_range(
        bbox.south,
        bbox.north,
        geometry.bbox.south,
        geometry.lat_step(),
        geometry.height,
    )?;
    let (col_lo, col_hi) = axis_range(
        bbox.west,
        bbox.east,
        geometry.bbox.west,
        geometry.lon_step(),
        geometry.width,
    )?;
    Some(CellWindow {
        row_lo,
        row_hi,
        col_lo,
        col_hi,
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct CellSelection {
    pub bbox_effective: Option<Bbox>,
    pub cells: Vec<GridCell>,
}

/// Emits valid cells inside the viewport. Rejects instead of truncating past `cap`.
pub fn select_cells(
    output: &PipelineOutput,
    viewport: &Bbox,
    cap: usize,
) -> Result<CellSelection, ApiError> {
    let geometry = &output.geometry;
    let Some(effective) = viewport.intersect(&geometry.bbox) else {
        return Ok(CellSelection {
            bbox_effective: None,
            cells: Vec::new(),
        });
    };
    let Some(window) = cell_window(geometry, &effective) else {
        return Ok(CellSelection {
            bbox_effective: Some(effective),
            cells: Vec::new(),
        });
    };

    // Index arithmetic only; nothing has been scanned yet.
    let estimated = window.cell_count();
    if estimated > cap {
        return Err(ApiError::TooLarge { estimated, cap });
    }

    let spec = &output.spec;
    let mut cells = Vec::new();
    for row in window.row_lo..=window.row_hi {
        let lat = geometry.lat_at_row(row);
        for col in window.col_lo..=window.col_hi {
            let value = output.grid.get(row, col);
            if !spec.is_valid(value) {
                continue;
            }
            if cells.len() >= cap {
                return Err(ApiError::TooLarge { estimated, cap });
            }
            let cloud = output
                .cloud
                .as_ref()
                .filter(|cloud| cloud.same_shape(&output.grid))
                .map(|cloud| cloud.get(row, col))
                .filter(|cloud| cloud.is_finite())
                .map(|cloud| cloud.clamp(0.0, 1.0));
            cells.push(GridCell {
                lat,
                lon: geometry.lon_at_col(col),
                value: value.clamp(0.0, spec.cap),
                cloud,
            });
        }
    }

    Ok(CellSelection {
        bbox_effective: Some(effective),
        cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GridStats;
    use crate::fusion::{FusionOutcome, FusionReport};
    use crate::pipeline::PipelineDiagnostics;
    use crate::synth::SynthesisReport;
    use crate::types::{Product, ProductSpec, ValueGrid};

    fn output(grid: ValueGrid, bbox: Bbox) -> PipelineOutput {
        let spec = ProductSpec {
            cap: 10.0,
            ..Product::No2.spec()
        };
        PipelineOutput {
            spec,
            geometry: GridGeometry {
                bbox,
                height: grid.height,
                width: grid.width,
                grid_deg: 1.0,
            },
            unit: "u".to_string(),
            cloud: None,
            domain: DisplayDomain {
                strategy: DomainStrategy::Fixed,
                min: 0.0,
                max: 10.0,
            },
            stats: GridStats::default(),
            diagnostics: PipelineDiagnostics {
                synthesis: SynthesisReport::default(),
                meteo: None,
                fusion: FusionReport::skipped(FusionOutcome::Disabled),
                hod_newest_gid: None,
                base_generated_at: None,
            },
            stations: Vec::new(),
            modified_ms: Some(0),
            grid,
        }
    }

    fn unit_bbox(north: f64, east: f64) -> Bbox {
        Bbox {
            south: 0.0,
            north,
            west: 0.0,
            east,
        }
    }

    #[test]
    fn palette_low_bins_are_translucent() {
        let table = palette_table(Palette::Viridis, PALETTE_BINS);
        assert_eq!(table.len(), PALETTE_BINS);
        assert_eq!(table[0][3], PALETTE_LOW_ALPHA[0]);
        assert_eq!(table[2][3], PALETTE_LOW_ALPHA[2]);
        assert_eq!(table[3][3], PALETTE_ALPHA);
        assert_eq!(&table[0][..3], &VIRIDIS_STOPS[0]);
        assert_eq!(&table[PALETTE_BINS - 1][..3], &VIRIDIS_STOPS[8]);
    }

    #[test]
    fn bins_are_clamped() {
        let domain = DisplayDomain {
            strategy: DomainStrategy::Fixed,
            min: 2.0,
            max: 4.0,
        };
        assert_eq!(palette_bin(1.0, &domain, 32), 0);
        assert_eq!(palette_bin(4.0, &domain, 32), 31);
        assert_eq!(palette_bin(100.0, &domain, 32), 31);
        assert_eq!(palette_bin(3.0, &domain, 32), 15);
    }

    #[test]
    fn raster_size_tracks_zoom_and_aspect() {
        let geometry = GridGeometry {
            bbox: unit_bbox(1.0, 2.0),
            height: 100,
            width: 200,
            grid_deg: 0.01,
        };
        assert_eq!(raster_size(3, &geometry), (512, 256));
        assert_eq!(raster_size(4, &geometry), (1024, 512));
        assert_eq!(raster_size(7, &geometry), (2048, 1024));
    }

    #[test]
    fn raster_puts_north_on_top_and_hides_invalid_cells() {
        let grid = ValueGrid::from_rows(vec![vec![10.0, f64::NAN], vec![0.0, 10.0]]).unwrap();
        let output = output(grid, unit_bbox(1.0, 1.0));
        let pixels = rasterize(&output, Palette::Gray, 4, 4);
        // Top-left pixel is row 1 (north) col 0 -> value 0.0, invalid for no2.
        assert_eq!(&pixels[0..4], &TRANSPARENT);
        // Bottom-left pixel is row 0 col 0 -> value 10 -> top bin.
        let bottom_left = 3 * 4 * 4;
        assert_eq!(pixels[bottom_left + 3], PALETTE_ALPHA);
        assert_eq!(pixels[bottom_left], GRAY_HIGH as u8);
        // Bottom-right is NaN.
        let bottom_right = bottom_left + 3 * 4;
        assert_eq!(&pixels[bottom_right..bottom_right + 4], &TRANSPARENT);
    }

    #[test]
    fn png_encoding_produces_signature_and_stable_etag() {
        let grid = ValueGrid::filled(2, 2, 5.0);
        let output = output(grid, unit_bbox(1.0, 1.0));
        let first = render_raster(&output, Palette::Viridis, 3).unwrap();
        let second = render_raster(&output, Palette::Viridis, 3).unwrap();
        assert_eq!(&first.png[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(first.etag, second.etag);
        assert_eq!(
            first.last_modified.as_deref(),
            Some("Thu, 01 Jan 1970 00:00:00 GMT")
        );
        assert_eq!(first.fusion, "disabled");
        assert_eq!(first.meteo, "off");
    }

    #[test]
    fn if_none_match_handling() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"abc\", W/\"def\""),
        );
        assert!(etag_matches(&headers, "\"def\""));
        assert!(!etag_matches(&headers, "\"xyz\""));
        assert!(!etag_matches(&HeaderMap::new(), "\"def\""));
    }

    #[tokio::test]
    async fn cache_honours_ttl_and_capacity() {
        let cache = RwLock::new(HashMap::new());
        let raster = RenderedRaster {
            png: vec![1, 2, 3],
            etag: etag_for(&[1, 2, 3]),
            last_modified: None,
            domain: String::new(),
            fusion: String::new(),
            meteo: String::new(),
        };
        store_raster(&cache, "a".into(), raster.clone(), 0, 100, 2).await;
        store_raster(&cache, "b".into(), raster.clone(), 10, 100, 2).await;
        store_raster(&cache, "c".into(), raster.clone(), 20, 100, 2).await;
        assert!(cached_raster(&cache, "a", 30).await.is_none());
        assert!(cached_raster(&cache, "b", 30).await.is_some());
        assert!(cached_raster(&cache, "c", 119).await.is_some());
        assert!(cached_raster(&cache, "c", 120).await.is_none());
    }

    #[test]
    fn cell_list_clips_to_dataset_and_emits_valid_cells() {
        let grid = ValueGrid::from_rows(vec![
            vec![1.0, 2.0, f64::NAN],
            vec![4.0, 50.0, 6.0],
            vec![7.0, 8.0, 9.0],
        ])
        .unwrap();
        let output = output(grid, unit_bbox(2.0, 2.0));
        let viewport = Bbox {
            south: -5.0,
            north: 1.0,
            west: 0.5,
            east: 10.0,
        };
        let selection = select_cells(&output, &viewport, 100).unwrap();
        assert_eq!(
            selection.bbox_effective,
            Some(Bbox {
                south: 0.0,
                north: 1.0,
                west: 0.5,
                east: 2.0,
            })
        );
        let values: Vec<f64> = selection.cells.iter().map(|cell| cell.value).collect();
        assert_eq!(values, vec![2.0, 10.0, 6.0]);
        assert_eq!(selection.cells[1].lat, 1.0);
        assert_eq!(selection.cells[1].lon, 1.0);
    }

    #[test]
    fn oversized_viewport_is_rejected_with_clipped_estimate() {
        let output = output(ValueGrid::filled(10, 10, 1.0), unit_bbox(9.0, 9.0));
        let viewport = Bbox {
            south: -50.0,
            north: 50.0,
            west: -50.0,
            east: 50.0,
        };
        match select_cells(&output, &viewport, 50) {
            Err(ApiError::TooLarge { estimated, cap }) => {
                assert_eq!(estimated, 100);
                assert_eq!(cap, 50);
                let window = cell_window(&output.geometry, &output.geometry.bbox).unwrap();
                assert_eq!(window.cell_count(), estimated);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert_eq!(select_cells(&output, &viewport, 100).unwrap().cells.len(), 100);
    }

    #[test]
    fn disjoint_viewport_is_empty() {
        let output = output(ValueGrid::filled(2, 2, 1.0), unit_bbox(1.0, 1.0));
        let viewport = Bbox {
            south: 10.0,
            north: 11.0,
            west: 10.0,
            east: 11.0,
        };
        let selection = select_cells(&output, &viewport, 10).unwrap();
        assert!(selection.bbox_effective.is_none());
        assert!(selection.cells.is_empty());
    }
}
