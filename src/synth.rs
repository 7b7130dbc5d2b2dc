use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::{
    HOD_EPSILON, HOD_RATIO_MAX, HOD_RATIO_MIN, HOURS_PER_DAY, SECONDS_PER_DAY, SECONDS_PER_HOUR,
};
use crate::storage::HodClimatology;
use crate::types::{GridGeometry, ProductSpec, ValueGrid};

#[derive(Clone, Debug, Default, Serialize)]
pub struct SynthesisReport {
    pub hour_offset: u32,
    pub valid_cells: usize,
    pub ratio_cells: usize,
    pub unadjusted_cells: usize,
    pub ratio_min: Option<f64>,
    pub ratio_max: Option<f64>,
}

pub fn local_hour(instant_utc_seconds: f64, longitude: f64) -> usize {
    let offset_seconds = (longitude / 360.0) * SECONDS_PER_DAY;
    let hours = ((instant_utc_seconds + offset_seconds) / SECONDS_PER_HOUR).floor();
    hours.rem_euclid(HOURS_PER_DAY as f64) as usize % HOURS_PER_DAY
}

pub fn hod_ratio(hod_last: f64, hod_target: f64) -> Option<f64> {
    if hod_last.is_finite() && hod_target.is_finite() && hod_last > HOD_EPSILON {
        Some((hod_target / hod_last).clamp(HOD_RATIO_MIN, HOD_RATIO_MAX))
    } else {
        None
    }
}

/// Cells without usable climatology keep the base value (ratio 1) while invalid base cells
/// become NaN.
pub fn synthesize(
    base: &ValueGrid,
    age_h: &ValueGrid,
    hod: Option<&HodClimatology>,
    geometry: &GridGeometry,
    hour_offset: u32,
    spec: &ProductSpec,
    now: DateTime<Utc>,
) -> (ValueGrid, SynthesisReport) {
    let mut report = SynthesisReport {
        hour_offset,
        ..SynthesisReport::default()
    };

    if hour_offset == 0 {
        let values: Vec<f64> = base.values.iter().map(|value| spec.sanitize(*value)).collect();
        report.valid_cells = values.iter().filter(|value| value.is_finite()).count();
        let grid = ValueGrid {
            height: base.height,
            width: base.width,
            values,
        };
        return (grid, report);
    }

    let now_seconds = now.timestamp_millis() as f64 / 1000.0;
    let longitudes = geometry.column_longitudes();
    let slices = hod
        .map(|climatology| climatology.slices.as_slice())
        .filter(|slices| slices.len() == HOURS_PER_DAY);
    let mut out = ValueGrid::nan(base.height, base.width);
    let mut ratio_min = f64::INFINITY;
    let mut ratio_max = f64::NEG_INFINITY;

    for row in 0..base.height {
        for (col, longitude) in longitudes.iter().enumerate().take(base.width) {
            let index = base.index(row, col);
            let value = base.values[index];
            if !spec.is_valid(value) {
                continue;
            }

            let age = age_h.values.get(index).copied().unwrap_or(f64::NAN);
            let age = if age.is_finite() { age } else { 0.0 };
            let observed_at = now_seconds - age * SECONDS_PER_HOUR;
            let last_hour = local_hour(observed_at, *longitude);
            let target_hour = (last_hour + hour_offset as usize) % HOURS_PER_DAY;

            let ratio = slices.and_then(|slices| {
                hod_ratio(
                    slices[last_hour].values[index],
                    slices[target_hour].values[index],
                )
            });
            let ratio = match ratio {
                Some(ratio) => {
                    report.ratio_cells += 1;
                    ratio_min = ratio_min.min(ratio);
                    ratio_max = ratio_max.max(ratio);
                    ratio
                }
                None => {
                    report.unadjusted_cells += 1;
                    1.0
                }
            };

            let forecast = spec.sanitize(value * ratio);
            if forecast.is_finite() {
                report.valid_cells += 1;
            }
            out.values[index] = forecast;
        }
    }

    if report.ratio_cells > 0 {
        report.ratio_min = Some(ratio_min);
        report.ratio_max = Some(ratio_max);
    }
    (out, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bbox, Product};
    use chrono::TimeZone;

    fn unit_geometry(height: usize, width: usize) -> GridGeometry {
        GridGeometry {
            bbox: Bbox {
                south: 0.0,
                north: 1.0,
                west: 0.0,
                east: 1.0,
            },
            height,
            width,
            grid_deg: 1.0,
        }
    }

    fn test_spec(cap: f64, allow_zero: bool) -> ProductSpec {
        ProductSpec {
            cap,
            allow_zero,
            ..Product::No2.spec()
        }
    }

    fn climatology(fill: impl Fn(usize) -> f64, height: usize, width: usize) -> HodClimatology {
        HodClimatology {
            slices: (0..24)
                .map(|hour| ValueGrid::filled(height, width, fill(hour)))
                .collect(),
            newest_gid: None,
            missing_hours: Vec::new(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn hour_zero_round_trips_values_within_cap() {
        let base = ValueGrid::from_rows(vec![vec![5.0, f64::NAN], vec![3.0, 2.0]]).unwrap();
        let age = ValueGrid::filled(2, 2, 0.0);
        let (out, report) = synthesize(
            &base,
            &age,
            None,
            &unit_geometry(2, 2),
            0,
            &test_spec(10.0, false),
            noon(),
        );
        assert_eq!(out.get(0, 0), 5.0);
        assert!(out.get(0, 1).is_nan());
        assert_eq!(out.get(1, 0), 3.0);
        assert_eq!(out.get(1, 1), 2.0);
        assert_eq!(report.valid_cells, 3);
    }

    #[test]
    fn hour_zero_clamps_to_cap_and_drops_disallowed_zero() {
        let base = ValueGrid::from_rows(vec![vec![50.0, 0.0, -1.0]]).unwrap();
        let age = ValueGrid::filled(1, 3, 0.0);
        let (out, _) = synthesize(
            &base,
            &age,
            None,
            &unit_geometry(1, 3),
            0,
            &test_spec(10.0, false),
            noon(),
        );
        assert_eq!(out.get(0, 0), 10.0);
        assert!(out.get(0, 1).is_nan());
        assert!(out.get(0, 2).is_nan());

        let (out, _) = synthesize(
            &base,
            &age,
            None,
            &unit_geometry(1, 3),
            0,
            &test_spec(10.0, true),
            noon(),
        );
        assert_eq!(out.get(0, 1), 0.0);
        assert_eq!(out.get(0, 2), 0.0);
    }

    #[test]
    fn local_hour_follows_longitude() {
        let midnight = Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap().timestamp() as f64;
        assert_eq!(local_hour(midnight, 0.0), 0);
        assert_eq!(local_hour(midnight, 90.0), 6);
        assert_eq!(local_hour(midnight, -90.0), 18);
        assert_eq!(local_hour(midnight, -75.0), 19);
        assert_eq!(local_hour(midnight + 1800.0, 180.0), 12);
    }

    #[test]
    fn ratio_is_clamped_for_extreme_climatology() {
        assert_eq!(hod_ratio(1e-6, 1000.0), Some(HOD_RATIO_MAX));
        assert_eq!(hod_ratio(1000.0, 1e-6), Some(HOD_RATIO_MIN));
        assert_eq!(hod_ratio(1e-12, 1000.0), None);
        assert_eq!(hod_ratio(f64::NAN, 1.0), None);
        assert_eq!(hod_ratio(2.0, 3.0), Some(1.5));
    }

    #[test]
    fn forecast_applies_clamped_ratio_between_local_hours() {
        // Longitude 0 at 12:00 UTC observed now -> last local hour 12, +2h -> 14.
        let base = ValueGrid::filled(1, 1, 4.0);
        let age = ValueGrid::filled(1, 1, 0.0);
        let geometry = GridGeometry {
            bbox: Bbox {
                south: 0.0,
                north: 0.0,
                west: 0.0,
                east: 0.0,
            },
            height: 1,
            width: 1,
            grid_deg: 0.1,
        };
        let hod = climatology(|hour| if hour == 14 { 1000.0 } else { 1e-6 }, 1, 1);
        let (out, report) =
            synthesize(&base, &age, Some(&hod), &geometry, 2, &test_spec(10.0, false), noon());
        assert_eq!(out.get(0, 0), 10.0, "4 * 3.0 clamps to cap");
        assert_eq!(report.ratio_max, Some(HOD_RATIO_MAX));

        let hod = climatology(|hour| if hour == 14 { 3.0 } else { 2.0 }, 1, 1);
        let (out, _) =
            synthesize(&base, &age, Some(&hod), &geometry, 2, &test_spec(10.0, false), noon());
        assert!((out.get(0, 0) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn age_shifts_the_observed_local_hour() {
        // Observed 3h ago at lon 0 -> local hour 9; +1h -> 10.
        let base = ValueGrid::filled(1, 1, 2.0);
        let age = ValueGrid::filled(1, 1, 3.0);
        let geometry = GridGeometry {
            height: 1,
            width: 1,
            ..unit_geometry(1, 1)
        };
        let hod = climatology(
            |hour| match hour {
                9 => 1.0,
                10 => 2.0,
                _ => f64::NAN,
            },
            1,
            1,
        );
        let (out, _) =
            synthesize(&base, &age, Some(&hod), &geometry, 1, &test_spec(10.0, false), noon());
        assert_eq!(out.get(0, 0), 4.0);
    }

    #[test]
    fn missing_climatology_keeps_value_but_invalid_base_stays_nan() {
        let base = ValueGrid::from_rows(vec![vec![3.0, f64::NAN, 0.0]]).unwrap();
        let age = ValueGrid::filled(1, 3, f64::NAN);
        let hod = climatology(|_| f64::NAN, 1, 3);
        let (out, report) = synthesize(
            &base,
            &age,
            Some(&hod),
            &unit_geometry(1, 3),
            5,
            &test_spec(10.0, false),
            noon(),
        );
        assert_eq!(out.get(0, 0), 3.0);
        assert!(out.get(0, 1).is_nan());
        assert!(out.get(0, 2).is_nan());
        assert_eq!(report.unadjusted_cells, 1);
        assert_eq!(report.ratio_cells, 0);
    }

    #[test]
    fn every_finite_output_is_within_cap() {
        let base = ValueGrid::from_rows(vec![vec![9.0, 1e9, 0.5, 7.0]]).unwrap();
        let age = ValueGrid::filled(1, 4, 1.0);
        let hod = climatology(|hour| (hour as f64 + 1.0).powi(3), 1, 4);
        for offset in 0..=12 {
            let (out, _) = synthesize(
                &base,
                &age,
                Some(&hod),
                &unit_geometry(1, 4),
                offset,
                &test_spec(10.0, false),
                noon(),
            );
            for value in out.values.iter().filter(|value| value.is_finite()) {
                assert!((0.0..=10.0).contains(value));
            }
        }
    }
}
