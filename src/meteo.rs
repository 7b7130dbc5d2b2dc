use serde::Serialize;
use tracing::debug;

use crate::constants::{
    DEFAULT_BETA_BLH, DEFAULT_BETA_WIND, DEFAULT_BLH0_M, DEFAULT_METEO_FACTOR_MAX,
    DEFAULT_METEO_FACTOR_MIN, DEFAULT_WS0_MPS, METEO_BBOX_TOLERANCE_DEG, METEO_EPSILON,
};
use crate::storage::MeteoField;
use crate::types::{GridGeometry, ProductSpec, ValueGrid};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FactorParams {
    pub beta: f64,
    pub reference: f64,
    pub factor_min: f64,
    pub factor_max: f64,
}

impl FactorParams {
    pub fn wind_default() -> Self {
        Self {
            beta: DEFAULT_BETA_WIND,
            reference: DEFAULT_WS0_MPS,
            factor_min: DEFAULT_METEO_FACTOR_MIN,
            factor_max: DEFAULT_METEO_FACTOR_MAX,
        }
    }

    pub fn blh_default() -> Self {
        Self {
            beta: DEFAULT_BETA_BLH,
            reference: DEFAULT_BLH0_M,
            factor_min: DEFAULT_METEO_FACTOR_MIN,
            factor_max: DEFAULT_METEO_FACTOR_MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeteoOptions {
    pub wind: Option<FactorParams>,
    pub blh: Option<FactorParams>,
}

impl MeteoOptions {
    pub fn any(&self) -> bool {
        self.wind.is_some() || self.blh.is_some()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FactorStats {
    pub applied: bool,
    pub applied_count: usize,
    pub factor_min: Option<f64>,
    pub factor_max: Option<f64>,
    pub factor_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FactorStats {
    pub fn not_applied(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MeteoReport {
    pub run_id: Option<String>,
    pub valid_time: Option<String>,
    pub wind: Option<FactorStats>,
    pub blh: Option<FactorStats>,
}

impl MeteoReport {
    pub fn skipped(options: &MeteoOptions, reason: &str) -> Self {
        Self {
            run_id: None,
            valid_time: None,
            wind: options.wind.map(|_| FactorStats::not_applied(reason)),
            blh: options.blh.map(|_| FactorStats::not_applied(reason)),
        }
    }
}

pub fn power_law_factor(driver: f64, params: &FactorParams) -> f64 {
    let ratio = (driver + METEO_EPSILON) / (params.reference + METEO_EPSILON);
    (params.beta * ratio.ln())
        .exp()
        .clamp(params.factor_min, params.factor_max)
}

pub fn apply_wind_factor(
    grid: &mut ValueGrid,
    u10: &ValueGrid,
    v10: &ValueGrid,
    params: &FactorParams,
    spec: &ProductSpec,
) -> FactorStats {
    if !grid.same_shape(u10) || !grid.same_shape(v10) {
        return FactorStats::not_applied("shape_mismatch");
    }
    apply_factor_field(
        grid,
        |index| {
            let u = u10.values[index];
            let v = v10.values[index];
            (u.is_finite() && v.is_finite()).then(|| u.hypot(v))
        },
        params,
        spec,
    )
}

pub fn apply_blh_factor(
    grid: &mut ValueGrid,
    blh: &ValueGrid,
    params: &FactorParams,
    spec: &ProductSpec,
) -> FactorStats {
    if !grid.same_shape(blh) {
        return FactorStats::not_applied("shape_mismatch");
    }
    apply_factor_field(
        grid,
        |index| {
            let height = blh.values[index];
            (height.is_finite() && height >= 0.0).then_some(height)
        },
        params,
        spec,
    )
}

fn apply_factor_field(
    grid: &mut ValueGrid,
    driver_at: impl Fn(usize) -> Option<f64>,
    params: &FactorParams,
    spec: &ProductSpec,
) -> FactorStats {
    let mut count = 0usize;
    let mut factor_min = f64::INFINITY;
    let mut factor_max = f64::NEG_INFINITY;
    let mut factor_sum = 0.0;

    for (index, value) in grid.values.iter_mut().enumerate() {
        if !value.is_finite() {
            continue;
        }
        let Some(driver) = driver_at(index) else {
            continue;
        };
        let factor = power_law_factor(driver, params);
        *value = spec.sanitize(*value * factor);
        count += 1;
        factor_min = factor_min.min(factor);
        factor_max = factor_max.max(factor);
        factor_sum += factor;
    }

    if count == 0 {
        return FactorStats::not_applied("no_cells");
    }
    FactorStats {
        applied: true,
        applied_count: count,
        factor_min: Some(factor_min),
        factor_max: Some(factor_max),
        factor_mean: Some(factor_sum / count as f64),
        reason: None,
    }
}

pub fn apply_meteo(
    grid: &mut ValueGrid,
    geometry: &GridGeometry,
    field: &MeteoField,
    options: &MeteoOptions,
    spec: &ProductSpec,
) -> MeteoReport {
    if !geometry.matches(
        &field.bbox,
        field.height,
        field.width,
        METEO_BBOX_TOLERANCE_DEG,
    ) {
        debug!(
            "Meteo run {} is {}x{} over {:?}, product grid is {}x{} over {:?}; skipping",
            field.run_id,
            field.height,
            field.width,
            field.bbox,
            geometry.height,
            geometry.width,
            geometry.bbox
        );
        let mut report = MeteoReport::skipped(options, "shape_bbox_mismatch");
        report.run_id = Some(field.run_id.clone());
        return report;
    }

    let wind = options
        .wind
        .map(|params| match (field.u10.as_ref(), field.v10.as_ref()) {
            (Some(u10), Some(v10)) => apply_wind_factor(grid, u10, v10, &params, spec),
            _ => FactorStats::not_applied("missing_variable"),
        });
    let blh = options.blh.map(|params| match field.blh.as_ref() {
        Some(blh) => apply_blh_factor(grid, blh, &params, spec),
        None => FactorStats::not_applied("missing_variable"),
    });

    MeteoReport {
        run_id: Some(field.run_id.clone()),
        valid_time: field.valid_time.clone(),
        wind,
        blh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bbox, Product};

    fn spec(cap: f64) -> ProductSpec {
        ProductSpec {
            cap,
            ..Product::No2.spec()
        }
    }

    fn geometry() -> GridGeometry {
        GridGeometry {
            bbox: Bbox {
                south: 0.0,
                north: 1.0,
                west: 0.0,
                east: 1.0,
            },
            height: 2,
            width: 2,
            grid_deg: 1.0,
        }
    }

    fn field(bbox: Bbox) -> MeteoField {
        MeteoField {
            run_id: "run".to_string(),
            bbox,
            height: 2,
            width: 2,
            valid_time: None,
            u10: Some(ValueGrid::filled(2, 2, 6.0)),
            v10: Some(ValueGrid::filled(2, 2, 8.0)),
            blh: Some(ValueGrid::filled(2, 2, 1600.0)),
        }
    }

    #[test]
    fn calm_wind_with_zero_reference_is_a_no_op() {
        let mut grid = ValueGrid::from_rows(vec![vec![1.0, 2.0], vec![f64::NAN, 4.0]]).unwrap();
        let before = grid.clone();
        let zeros = ValueGrid::filled(2, 2, 0.0);
        let params = FactorParams {
            reference: 0.0,
            ..FactorParams::wind_default()
        };
        let stats = apply_wind_factor(&mut grid, &zeros, &zeros, &params, &spec(10.0));
        assert_eq!(grid.values[..2], before.values[..2]);
        assert!(grid.get(1, 0).is_nan());
        assert_eq!(grid.get(1, 1), 4.0);
        assert_eq!(stats.applied_count, 3);
        assert_eq!(stats.factor_mean, Some(1.0));
    }

    #[test]
    fn stronger_wind_dilutes_within_bounds() {
        let mut grid = ValueGrid::filled(1, 1, 5.0);
        let u = ValueGrid::filled(1, 1, 30.0);
        let v = ValueGrid::filled(1, 1, 40.0);
        let params = FactorParams {
            beta: -1.0,
            reference: 5.0,
            factor_min: 0.5,
            factor_max: 2.0,
        };
        let stats = apply_wind_factor(&mut grid, &u, &v, &params, &spec(10.0));
        // (50 / 5)^-1 = 0.1, bounded to 0.5.
        assert_eq!(stats.factor_min, Some(0.5));
        assert_eq!(grid.get(0, 0), 2.5);
    }

    #[test]
    fn factor_never_turns_nan_into_a_value() {
        let mut grid = ValueGrid::filled(1, 2, f64::NAN);
        let blh = ValueGrid::filled(1, 2, 200.0);
        let stats = apply_blh_factor(&mut grid, &blh, &FactorParams::blh_default(), &spec(10.0));
        assert!(grid.values.iter().all(|value| value.is_nan()));
        assert!(!stats.applied);
        assert_eq!(stats.reason.as_deref(), Some("no_cells"));
    }

    #[test]
    fn amplified_values_are_clamped_to_cap() {
        let mut grid = ValueGrid::filled(1, 1, 9.0);
        let blh = ValueGrid::filled(1, 1, 10.0);
        apply_blh_factor(&mut grid, &blh, &FactorParams::blh_default(), &spec(10.0));
        assert_eq!(grid.get(0, 0), 10.0);
    }

    #[test]
    fn misaligned_field_is_skipped_entirely() {
        let mut grid = ValueGrid::filled(2, 2, 1.0);
        let shifted = Bbox {
            south: 0.0,
            north: 1.0,
            west: 0.0,
            east: 1.001,
        };
        let options = MeteoOptions {
            wind: Some(FactorParams::wind_default()),
            blh: Some(FactorParams::blh_default()),
        };
        let report = apply_meteo(&mut grid, &geometry(), &field(shifted), &options, &spec(10.0));
        assert_eq!(grid, ValueGrid::filled(2, 2, 1.0));
        assert_eq!(
            report.wind.unwrap().reason.as_deref(),
            Some("shape_bbox_mismatch")
        );
    }

    #[test]
    fn wind_then_blh_compose_multiplicatively() {
        let mut grid = ValueGrid::filled(2, 2, 1.0);
        let options = MeteoOptions {
            wind: Some(FactorParams::wind_default()),
            blh: Some(FactorParams::blh_default()),
        };
        let report = apply_meteo(&mut grid, &geometry(), &field(geometry().bbox), &options, &spec(10.0));
        let wind = power_law_factor(10.0, &FactorParams::wind_default());
        let blh = power_law_factor(1600.0, &FactorParams::blh_default());
        assert!((grid.get(0, 0) - wind * blh).abs() < 1e-12);
        assert!(report.wind.unwrap().applied);
        assert!(report.blh.unwrap().applied);
    }
}
