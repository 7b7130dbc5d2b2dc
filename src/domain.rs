use serde::Serialize;

use crate::constants::{
    DOMAIN_EPSILON_REL, DOMAIN_MIN_SPAN_CAP_FRACTION, DOMAIN_MIN_SPAN_RANGE_FRACTION,
};
use crate::types::{DisplayDomain, DomainStrategy, ProductSpec, ValueGrid};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DomainMode {
    Auto,
    Fixed { min: f64, max: f64 },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GridStats {
    pub count: usize,
    pub min: Option<f64>,
    pub p10: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub max: Option<f64>,
    pub unique_count: usize,
}

pub fn sorted_valid_values(grid: &ValueGrid, spec: &ProductSpec) -> Vec<f64> {
    let mut values: Vec<f64> = grid
        .values
        .iter()
        .copied()
        .filter(|value| spec.is_valid(*value))
        .map(|value| value.clamp(0.0, spec.cap))
        .collect();
    values.sort_by(f64::total_cmp);
    values
}

fn epsilon(spec: &ProductSpec) -> f64 {
    (spec.cap.abs() * DOMAIN_EPSILON_REL).max(f64::MIN_POSITIVE)
}

/// Always `max > min` within `[0, cap]`.
pub fn estimate_domain(sorted: &[f64], spec: &ProductSpec) -> DisplayDomain {
    let cap = spec.cap;
    let auto = |min: f64, max: f64| DisplayDomain {
        strategy: DomainStrategy::Auto,
        min,
        max,
    };
    if sorted.is_empty() {
        return auto(0.0, cap);
    }

    let n = sorted.len();
    let last = n - 1;
    let low_index = ((n as f64 * spec.q_low).floor() as usize).min(last);
    let high_index = ((n as f64 * spec.q_high).ceil() as usize).min(last);
    let eps = epsilon(spec);
    let mut min = sorted[low_index];
    let mut max = sorted[high_index].max(min + eps);

    let min_span = (DOMAIN_MIN_SPAN_CAP_FRACTION * cap)
        .max(DOMAIN_MIN_SPAN_RANGE_FRACTION * (sorted[last] - sorted[0]));
    if max - min < min_span {
        let mid = (min + max) / 2.0;
        min = mid - min_span / 2.0;
        max = mid + min_span / 2.0;
    }

    // Re-clamping may pin one side; shift the window rather than collapse it.
    if min < 0.0 {
        max = (max - min).min(cap);
        min = 0.0;
    }
    if max > cap {
        min = (min - (max - cap)).max(0.0);
        max = cap;
    }
    if max - min < eps {
        if max + eps <= cap {
            max = min + eps;
        } else {
            min = (max - eps).max(0.0);
        }
    }
    auto(min, max)
}

pub fn parse_domain(raw: Option<&str>, spec: &ProductSpec) -> Result<DomainMode, String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(DomainMode::Auto);
    };
    if raw.eq_ignore_ascii_case("auto") {
        return Ok(DomainMode::Auto);
    }
    let (min, max) = raw
        .split_once(',')
        .ok_or_else(|| format!("Invalid domain '{raw}': expected 'auto' or '<min>,<max>'"))?;
    let min: f64 = min
        .trim()
        .parse()
        .map_err(|_| format!("Invalid domain minimum '{}'", min.trim()))?;
    let max: f64 = max
        .trim()
        .parse()
        .map_err(|_| format!("Invalid domain maximum '{}'", max.trim()))?;
    if !min.is_finite() || !max.is_finite() {
        return Err("Domain bounds must be finite".to_string());
    }
    let min = min.clamp(0.0, spec.cap);
    let max = max.clamp(0.0, spec.cap);
    if max <= min {
        return Err(format!(
            "Domain maximum must exceed minimum after clamping to [0, {}]",
            spec.cap
        ));
    }
    Ok(DomainMode::Fixed { min, max })
}

pub fn resolve_domain(mode: DomainMode, sorted: &[f64], spec: &ProductSpec) -> DisplayDomain {
    match mode {
        DomainMode::Auto => estimate_domain(sorted, spec),
        DomainMode::Fixed { min, max } => DisplayDomain {
            strategy: DomainStrategy::Fixed,
            min,
            max,
        },
    }
}

pub fn grid_stats(sorted: &[f64]) -> GridStats {
    if sorted.is_empty() {
        return GridStats::default();
    }
    let pick = |q: f64| {
        let index = ((sorted.len() - 1) as f64 * q).round() as usize;
        Some(sorted[index.min(sorted.len() - 1)])
    };
    let mut unique_count = 1;
    for pair in sorted.windows(2) {
        if pair[1] != pair[0] {
            unique_count += 1;
        }
    }
    GridStats {
        count: sorted.len(),
        min: sorted.first().copied(),
        p10: pick(0.10),
        p50: pick(0.50),
        p90: pick(0.90),
        max: sorted.last().copied(),
        unique_count,
    }
}

pub fn normalize(value: f64, domain: &DisplayDomain) -> f64 {
    let span = domain.max - domain.min;
    if !value.is_finite() || span <= 0.0 {
        return 0.0;
    }
    ((value - domain.min) / span).clamp(0.0, 1.0)
}
