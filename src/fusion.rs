use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_FUSION_MAX_AGE_H, DEFAULT_FUSION_POWER, DEFAULT_FUSION_RADIUS_KM,
    DEFAULT_FUSION_W_MAX, DEG_TO_RAD, IDW_FULL_COVERAGE_STATIONS, IDW_MIN_COVERAGE_WEIGHT,
    IDW_NEAR_ZERO_KM, IDW_NEAR_ZERO_WEIGHT, KM_PER_DEGREE, SPARSE_AUTO_SCALE_SAMPLES,
};
use crate::types::{GridGeometry, ProductSpec, StationPoint, ValueGrid};
use crate::utils::{clamp, planar_distance_km};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusionParams {
    pub radius_km: f64,
    pub power: f64,
    pub max_age_h: f64,
    pub w_max: f64,
    pub auto_scale: bool,
    pub force: bool,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_FUSION_RADIUS_KM,
            power: DEFAULT_FUSION_POWER,
            max_age_h: DEFAULT_FUSION_MAX_AGE_H,
            w_max: DEFAULT_FUSION_W_MAX,
            auto_scale: true,
            force: false,
        }
    }
}

impl FusionParams {
    pub fn cache_key(&self) -> String {
        format!(
            "r{}p{}a{}w{}s{}f{}",
            self.radius_km,
            self.power,
            self.max_age_h,
            self.w_max,
            u8::from(self.auto_scale),
            u8::from(self.force)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionOutcome {
    Ok,
    Disabled,
    EmptyData,
    UnitMismatch,
    WeightZero,
    NoCoverage,
    NoStationNetwork,
    HistoricalGranule,
}

impl FusionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FusionOutcome::Ok => "ok",
            FusionOutcome::Disabled => "disabled",
            FusionOutcome::EmptyData => "empty_data",
            FusionOutcome::UnitMismatch => "unit_mismatch",
            FusionOutcome::WeightZero => "weight_zero",
            FusionOutcome::NoCoverage => "no_coverage",
            FusionOutcome::NoStationNetwork => "no_station_network",
            FusionOutcome::HistoricalGranule => "historical_granule",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FusionReport {
    pub applied: bool,
    pub why: FusionOutcome,
    pub used: usize,
    pub mean_age_h: Option<f64>,
    pub grid_cover_pct: f64,
    pub auto_scale_factor: Option<f64>,
    pub auto_scale_samples: usize,
    pub station_unit: Option<String>,
    pub grid_unit: Option<String>,
    pub snapshot: Option<String>,
}

impl FusionReport {
    pub fn skipped(why: FusionOutcome) -> Self {
        Self {
            applied: false,
            why,
            used: 0,
            mean_age_h: None,
            grid_cover_pct: 0.0,
            auto_scale_factor: None,
            auto_scale_samples: 0,
            station_unit: None,
            grid_unit: None,
            snapshot: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IdwField {
    pub values: ValueGrid,
    pub coverage: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitFamily {
    ColumnDensity,
    Dobson,
    Surface,
    Unknown,
}

fn unit_family(unit: &str) -> UnitFamily {
    let unit = unit.to_ascii_lowercase();
    if unit.contains("molec") {
        UnitFamily::ColumnDensity
    } else if unit.contains("dobson") || unit.trim() == "du" {
        UnitFamily::Dobson
    } else if ["ppb", "ppm", "ug", "µg"].iter().any(|tag| unit.contains(tag)) {
        UnitFamily::Surface
    } else {
        UnitFamily::Unknown
    }
}

pub fn units_compatible(station_unit: Option<&str>, grid_unit: Option<&str>) -> bool {
    match (station_unit, grid_unit) {
        (Some(station), Some(grid)) => {
            let station = unit_family(station);
            let grid = unit_family(grid);
            station == grid || station == UnitFamily::Unknown || grid == UnitFamily::Unknown
        }
        _ => true,
    }
}

pub fn median_scale_ratio(
    grid: &ValueGrid,
    points: &[StationPoint],
    geometry: &GridGeometry,
) -> Option<(f64, usize)> {
    let mut ratios: Vec<f64> = points
        .iter()
        .filter(|point| point.val > 0.0)
        .filter_map(|point| {
            let (row, col) = geometry.nearest_cell(point.lat, point.lon)?;
            let cell = grid.get(row, col);
            (cell.is_finite() && cell > 0.0).then(|| cell / point.val)
        })
        .filter(|ratio| ratio.is_finite() && *ratio > 0.0)
        .collect();
    if ratios.is_empty() {
        return None;
    }
    ratios.sort_by(f64::total_cmp);
    let mid = ratios.len() / 2;
    let median = if ratios.len() % 2 == 0 {
        (ratios[mid - 1] + ratios[mid]) / 2.0
    } else {
        ratios[mid]
    };
    Some((median, ratios.len()))
}

pub fn idw_interpolate(
    points: &[StationPoint],
    geometry: &GridGeometry,
    radius_km: f64,
    power: f64,
) -> IdwField {
    let height = geometry.height;
    let width = geometry.width;
    let mut weight_sum = vec![0.0f64; height * width];
    let mut value_sum = vec![0.0f64; height * width];
    let mut coverage = vec![0u32; height * width];
    let latitudes = geometry.row_latitudes();
    let longitudes = geometry.column_longitudes();
    let lat_step = geometry.lat_step();
    let lon_step = geometry.lon_step();

    for point in points {
        let (row_lo, row_hi) = index_window(
            point.lat,
            radius_km / KM_PER_DEGREE,
            geometry.bbox.south,
            lat_step,
            height,
        );
        // Widest longitude reach occurs at the poleward edge of the latitude window.
        let poleward = (point.lat.abs() + radius_km / KM_PER_DEGREE).min(89.0);
        let lon_reach = radius_km / (KM_PER_DEGREE * (poleward * DEG_TO_RAD).cos());
        let (col_lo, col_hi) = index_window(
            point.lon,
            lon_reach,
            geometry.bbox.west,
            lon_step,
            width,
        );
        if row_lo > row_hi || col_lo > col_hi {
            continue;
        }

        for row in row_lo..=row_hi {
            let lat = latitudes[row];
            for col in col_lo..=col_hi {
                let distance = planar_distance_km(lat, longitudes[col], point.lat, point.lon);
                if distance > radius_km {
                    continue;
                }
                let weight = if distance < IDW_NEAR_ZERO_KM {
                    IDW_NEAR_ZERO_WEIGHT
                } else {
                    1.0 / distance.powf(power)
                };
                let index = row * width + col;
                weight_sum[index] += weight;
                value_sum[index] += weight * point.val;
                coverage[index] += 1;
            }
        }
    }

    let values = weight_sum
        .iter()
        .zip(value_sum.iter())
        .map(|(weight, sum)| if *weight > 0.0 { sum / weight } else { f64::NAN })
        .collect();
    IdwField {
        values: ValueGrid {
            height,
            width,
            values,
        },
        coverage,
    }
}

fn index_window(center: f64, reach: f64, origin: f64, step: f64, len: usize) -> (usize, usize) {
    if len == 0 {
        return (1, 0);
    }
    if step <= 0.0 || len == 1 {
        return (0, 0);
    }
    let lo = ((center - reach - origin) / step).floor();
    let hi = ((center + reach - origin) / step).ceil();
    if hi < 0.0 || lo > (len - 1) as f64 {
        return (1, 0);
    }
    (lo.max(0.0) as usize, (hi as usize).min(len - 1))
}

/// Blends stations into `grid` in place. The grid is untouched unless the report says `applied`.
pub fn fuse(
    grid: &mut ValueGrid,
    points: &[StationPoint],
    geometry: &GridGeometry,
    params: &FusionParams,
    spec: &ProductSpec,
    station_unit: Option<&str>,
    grid_unit: Option<&str>,
) -> FusionReport {
    let mut report = FusionReport {
        station_unit: station_unit.map(str::to_string),
        grid_unit: grid_unit.map(str::to_string),
        ..FusionReport::skipped(FusionOutcome::EmptyData)
    };

    let mut usable: Vec<StationPoint> = points
        .iter()
        .filter(|point| params.force || point.age_h <= params.max_age_h)
        .filter(|point| point.lat.is_finite() && point.lon.is_finite())
        .filter(|point| spec.is_valid(point.val))
        .cloned()
        .collect();
    if usable.is_empty() {
        return report;
    }

    if !units_compatible(station_unit, grid_unit) {
        let scale = if params.auto_scale {
            median_scale_ratio(grid, &usable, geometry)
        } else {
            None
        };
        match scale {
            Some((scale, samples)) => {
                // No minimum sample size is enforced; a thin sample is only reported.
                if samples < SPARSE_AUTO_SCALE_SAMPLES {
                    warn!(
                        "Unit auto-scale factor {scale:e} derived from only {samples} station(s) ({:?} -> {:?})",
                        station_unit,
                        grid_unit
                    );
                } else {
                    debug!(
                        "Rescaling {} stations by median ratio {scale:e} over {samples} samples ({:?} -> {:?})",
                        usable.len(),
                        station_unit,
                        grid_unit
                    );
                }
                for point in usable.iter_mut() {
                    point.val *= scale;
                }
                report.auto_scale_factor = Some(scale);
                report.auto_scale_samples = samples;
            }
            None if params.force => {}
            None => {
                report.why = FusionOutcome::UnitMismatch;
                return report;
            }
        }
    }

    let mean_age =
        usable.iter().map(|point| point.age_h.max(0.0)).sum::<f64>() / usable.len() as f64;
    let freshness = if params.max_age_h > 0.0 {
        clamp(1.0 - mean_age / params.max_age_h, 0.0, 1.0)
    } else {
        0.0
    };
    let base_weight = clamp(params.w_max, 0.0, 1.0) * freshness;
    report.used = usable.len();
    report.mean_age_h = Some(mean_age);
    if base_weight <= 0.0 {
        report.why = FusionOutcome::WeightZero;
        return report;
    }

    let field = idw_interpolate(&usable, geometry, params.radius_km, params.power);
    let mut covered = 0usize;
    for (index, value) in grid.values.iter_mut().enumerate() {
        let estimate = field.values.values[index];
        if !estimate.is_finite() {
            continue;
        }
        covered += 1;
        let coverage = field.coverage[index] as f64;
        let local = base_weight
            * clamp(
                coverage / IDW_FULL_COVERAGE_STATIONS,
                IDW_MIN_COVERAGE_WEIGHT,
                1.0,
            );
        let blended = if value.is_finite() {
            local * estimate + (1.0 - local) * *value
        } else {
            estimate
        };
        *value = spec.sanitize(blended);
    }

    if covered == 0 {
        report.why = FusionOutcome::NoCoverage;
        return report;
    }
    let cells = grid.values.len().max(1);
    report.grid_cover_pct = 100.0 * covered as f64 / cells as f64;
    report.applied = true;
    report.why = FusionOutcome::Ok;
    report
}
