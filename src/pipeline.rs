use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::constants::MAX_HOUR_OFFSET;
use crate::domain::{grid_stats, resolve_domain, sorted_valid_values, DomainMode, GridStats};
use crate::error::ApiError;
use crate::fusion::{fuse, FusionOutcome, FusionParams, FusionReport};
use crate::meteo::{apply_meteo, MeteoOptions, MeteoReport};
use crate::stations::StationStore;
use crate::storage::GridStore;
use crate::synth::{synthesize, SynthesisReport};
use crate::types::{DisplayDomain, GridGeometry, Product, ProductSpec, StationPoint, ValueGrid};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GridTime {
    Hour(u32),
    Granule(String),
}

impl GridTime {
    pub fn hour_offset(&self) -> u32 {
        match self {
            GridTime::Hour(hour) => *hour,
            GridTime::Granule(_) => 0,
        }
    }

    pub fn cache_key(&self) -> String {
        match self {
            GridTime::Hour(hour) => format!("h{hour}"),
            GridTime::Granule(gid) => format!("g{gid}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineRequest {
    pub product: Product,
    pub time: GridTime,
    pub meteo: MeteoOptions,
    pub fusion: Option<FusionParams>,
    pub domain: DomainMode,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineDiagnostics {
    pub synthesis: SynthesisReport,
    pub meteo: Option<MeteoReport>,
    pub fusion: FusionReport,
    pub hod_newest_gid: Option<String>,
    pub base_generated_at: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PipelineOutput {
    pub spec: ProductSpec,
    pub geometry: GridGeometry,
    pub unit: String,
    pub grid: ValueGrid,
    pub cloud: Option<ValueGrid>,
    pub domain: DisplayDomain,
    pub stats: GridStats,
    pub diagnostics: PipelineDiagnostics,
    pub stations: Vec<StationPoint>,
    pub modified_ms: Option<i64>,
}

pub fn validate_time(hour: Option<u32>, gid: Option<&str>) -> Result<GridTime, ApiError> {
    match (hour, gid.map(str::trim).filter(|gid| !gid.is_empty())) {
        (Some(hour), Some(_)) if hour > 0 => Err(ApiError::BadRequest(
            "Forecast hours cannot be combined with a granule id.".to_string(),
        )),
        (_, Some(gid)) => {
            if crate::storage::is_safe_gid(gid) {
                Ok(GridTime::Granule(gid.to_string()))
            } else {
                Err(ApiError::BadRequest(format!("Invalid granule id '{gid}'.")))
            }
        }
        (Some(hour), None) if hour > MAX_HOUR_OFFSET => Err(ApiError::BadRequest(format!(
            "Hour offset must be between 0 and {MAX_HOUR_OFFSET}."
        ))),
        (hour, None) => Ok(GridTime::Hour(hour.unwrap_or(0))),
    }
}

pub fn run_pipeline(cfg: &Config, request: &PipelineRequest) -> Result<PipelineOutput, ApiError> {
    let spec = request.product.spec();
    let store = GridStore::new(cfg);
    let hour_offset = request.time.hour_offset();

    let base = match &request.time {
        GridTime::Hour(_) => store.load_base(request.product)?,
        GridTime::Granule(gid) => store.load_granule(request.product, gid)?,
    };
    let geometry = base.geometry;

    let hod = if hour_offset > 0 {
        Some(store.load_hod(request.product, &geometry)?)
    } else {
        None
    };
    let (mut grid, synthesis) = synthesize(
        &base.value,
        &base.age_h,
        hod.as_ref(),
        &geometry,
        hour_offset,
        &spec,
        request.now,
    );

    let meteo = if hour_offset >= 1 && request.meteo.any() {
        Some(match store.load_meteo(hour_offset) {
            Ok(field) => apply_meteo(&mut grid, &geometry, &field, &request.meteo, &spec),
            Err(error) => {
                debug!("Meteo +{hour_offset}h unavailable: {error}");
                MeteoReport::skipped(&request.meteo, "unavailable")
            }
        })
    } else {
        None
    };

    let mut stations = Vec::new();
    let fusion = match (&request.fusion, &request.time, spec.station_param) {
        (None, _, _) => FusionReport::skipped(FusionOutcome::Disabled),
        (Some(_), GridTime::Granule(_), _) => FusionReport::skipped(FusionOutcome::HistoricalGranule),
        (Some(_), _, None) => FusionReport::skipped(FusionOutcome::NoStationNetwork),
        (Some(params), GridTime::Hour(_), Some(param)) => {
            let set = StationStore::new(cfg).load_recent(param, request.now, params.max_age_h);
            let mut report = fuse(
                &mut grid,
                &set.points,
                &geometry,
                params,
                &spec,
                set.unit.as_deref(),
                Some(base.unit.as_str()),
            );
            report.snapshot = set.snapshot;
            stations = set.points;
            report
        }
    };

    let sorted = sorted_valid_values(&grid, &spec);
    let domain = resolve_domain(request.domain, &sorted, &spec);
    let stats = grid_stats(&sorted);
    info!(
        "{} {}: {} valid cells, domain [{:e}, {:e}], fusion {}",
        request.product,
        request.time.cache_key(),
        stats.count,
        domain.min,
        domain.max,
        fusion.why.as_str()
    );

    Ok(PipelineOutput {
        spec,
        geometry,
        unit: base.unit,
        grid,
        cloud: base.cloud,
        domain,
        stats,
        diagnostics: PipelineDiagnostics {
            synthesis,
            meteo,
            fusion,
            hod_newest_gid: hod.and_then(|hod| hod.newest_gid),
            base_generated_at: base.generated_at,
        },
        stations,
        modified_ms: base.modified_ms,
    })
}
