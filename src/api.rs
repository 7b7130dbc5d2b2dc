use std::str::FromStr;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    cell_cap_for_zoom, DEFAULT_POINT_POLLUTANTS, MAX_HOUR_OFFSET, MAX_RASTER_ZOOM, MAX_ZOOM,
    MIN_ZOOM,
};
use crate::domain::{parse_domain, GridStats};
use crate::error::ApiError;
use crate::fusion::FusionParams;
use crate::meteo::{FactorParams, MeteoOptions};
use crate::pipeline::{
    run_pipeline, validate_time, GridTime, PipelineDiagnostics, PipelineOutput, PipelineRequest,
};
use crate::point::{assess_point, CellSource, PointAssessment};
use crate::render::{
    cached_raster, etag_matches, raster_headers, render_raster, select_cells, store_raster,
    validate_zoom, RenderedRaster,
};
use crate::storage::{GranuleEntry, GridStore};
use crate::types::{AppState, Bbox, DisplayDomain, GridCell, Palette, Product, StationPoint};
use crate::utils::iso_from_ms;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GridQuery {
    #[serde(default)]
    hour: Option<u32>,
    #[serde(default)]
    gid: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    palette: Option<String>,
    #[serde(default)]
    wind: Option<String>,
    #[serde(default)]
    blh: Option<String>,
    #[serde(default)]
    stations: Option<String>,
    #[serde(default)]
    radius_km: Option<f64>,
    #[serde(default)]
    power: Option<f64>,
    #[serde(default)]
    max_age_h: Option<f64>,
    #[serde(default)]
    w_max: Option<f64>,
    #[serde(default)]
    auto_scale: Option<String>,
    #[serde(default)]
    force: Option<String>,
    #[serde(default)]
    bbox: Option<String>,
    #[serde(default)]
    z: Option<u8>,
    #[serde(default)]
    debug_stations: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PointQuery {
    lat: f64,
    lon: f64,
    #[serde(default)]
    hour: Option<u32>,
    #[serde(default)]
    pollutants: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProductMeta {
    product: Product,
    unit: String,
    shape: Option<[usize; 2]>,
    bbox: Option<Bbox>,
    grid_deg: Option<f64>,
    generated_at: Option<String>,
    cap: f64,
    allow_zero: bool,
    palette: Palette,
    latest_available: bool,
    latest_modified: Option<String>,
    hod_newest_gid: Option<String>,
    hod_hour_counts: Vec<u64>,
    hod_slices: usize,
    granule_count: usize,
    station_param: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MetaResponse {
    generated_at: String,
    data_root: String,
    products: Vec<ProductMeta>,
    meteo_latest_run: Option<String>,
    meteo_hours: Vec<u32>,
    zoom: [u8; 2],
    max_raster_zoom: u8,
    max_hour_offset: u32,
}

#[derive(Debug, Serialize)]
struct GridResponse {
    product: Product,
    unit: String,
    hour: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<String>,
    zoom: u8,
    bbox_requested: Bbox,
    bbox_effective: Option<Bbox>,
    domain: DisplayDomain,
    stats: GridStats,
    cell_count: usize,
    cap: usize,
    cells: Vec<GridCell>,
    diagnostics: PipelineDiagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    stations: Option<Vec<StationPoint>>,
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn meta(State(state): State<AppState>) -> Result<Json<MetaResponse>, ApiError> {
    let cfg = state.cfg.clone();
    let response = tokio::task::spawn_blocking(move || {
        let store = GridStore::new(&cfg);
        let products = Product::ALL
            .iter()
            .map(|product| {
                let spec = product.spec();
                let modified = store.latest_modified_ms(*product);
                let hod = store.load_hod_meta(*product);
                let header = store
                    .load_base_header(*product)
                    .map_err(|error| debug!("No base header for {product}: {error}"))
                    .ok();
                ProductMeta {
                    product: *product,
                    unit: header
                        .as_ref()
                        .map(|header| header.unit.clone())
                        .unwrap_or_else(|| spec.unit.to_string()),
                    shape: header
                        .as_ref()
                        .map(|header| [header.geometry.height, header.geometry.width]),
                    bbox: header.as_ref().map(|header| header.geometry.bbox),
                    grid_deg: header.as_ref().map(|header| header.geometry.grid_deg),
                    generated_at: header.and_then(|header| header.generated_at),
                    cap: spec.cap,
                    allow_zero: spec.allow_zero,
                    palette: spec.palette,
                    latest_available: modified.is_some(),
                    latest_modified: modified.and_then(iso_from_ms),
                    hod_newest_gid: hod.newest_gid,
                    hod_hour_counts: hod.hour_counts,
                    hod_slices: store.hod_slice_count(*product),
                    granule_count: store
                        .load_granule_index(*product)
                        .map(|entries| entries.len())
                        .unwrap_or(0),
                    station_param: spec.station_param,
                }
            })
            .collect();
        let meteo = store.load_meteo_index().ok();
        MetaResponse {
            generated_at: Utc::now().to_rfc3339(),
            data_root: cfg.data_root.display().to_string(),
            products,
            meteo_latest_run: meteo.as_ref().map(|index| index.latest_run.clone()),
            meteo_hours: meteo.map(|index| index.hours).unwrap_or_default(),
            zoom: [MIN_ZOOM, MAX_ZOOM],
            max_raster_zoom: MAX_RASTER_ZOOM,
            max_hour_offset: MAX_HOUR_OFFSET,
        }
    })
    .await
    .map_err(|error| ApiError::Internal(format!("Meta task failed: {error}")))?;
    Ok(Json(response))
}

pub async fn granules(
    State(state): State<AppState>,
    Path(product): Path<String>,
) -> Result<Json<Vec<GranuleEntry>>, ApiError> {
    let product = parse_product(&product)?;
    let cfg = state.cfg.clone();
    let entries =
        tokio::task::spawn_blocking(move || GridStore::new(&cfg).load_granule_index(product))
            .await
            .map_err(|error| ApiError::Internal(format!("Granule index task failed: {error}")))??;
    Ok(Json(entries))
}

pub async fn tile(
    State(state): State<AppState>,
    Path((product, zoom)): Path<(String, String)>,
    query: Result<Query<GridQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let product = parse_product(&product)?;
    let zoom = parse_zoom(&zoom)?;
    if zoom > MAX_RASTER_ZOOM {
        return Err(ApiError::BadRequest(format!(
            "Raster tiles stop at zoom {MAX_RASTER_ZOOM}; use /v1/grid for higher zooms."
        )));
    }
    let palette = match query.palette.as_deref() {
        Some(raw) => Palette::from_str(raw).map_err(ApiError::BadRequest)?,
        None => product.spec().palette,
    };
    let request = build_request(product, &query)?;

    let cfg = state.cfg.clone();
    let stamp = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || GridStore::new(&cfg).latest_modified_ms(product))
            .await
            .ok()
            .flatten()
    };
    let cache_key = raster_cache_key(&request, &query, zoom, palette, stamp);
    let now_ms = Utc::now().timestamp_millis();
    let ttl_seconds = cfg.raster_cache_ttl.as_secs();

    if let Some(raster) = cached_raster(&state.raster_cache, &cache_key, now_ms).await {
        return Ok(raster_response(&raster, &headers, ttl_seconds));
    }

    let raster = tokio::task::spawn_blocking(move || {
        let output = run_pipeline(&cfg, &request)?;
        render_raster(&output, palette, zoom)
    })
    .await
    .map_err(|error| ApiError::Internal(format!("Raster task failed: {error}")))??;

    store_raster(
        &state.raster_cache,
        cache_key,
        raster.clone(),
        now_ms,
        state.cfg.raster_cache_ttl.as_millis() as i64,
        state.cfg.raster_cache_max_entries,
    )
    .await;
    Ok(raster_response(&raster, &headers, ttl_seconds))
}

pub async fn grid(
    State(state): State<AppState>,
    Path(product): Path<String>,
    query: Result<Query<GridQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let product = parse_product(&product)?;
    let zoom = validate_zoom(query.z.unwrap_or(MAX_RASTER_ZOOM + 1))?;
    let viewport = match query.bbox.as_deref() {
        Some(raw) => Some(parse_bbox(raw)?),
        None => None,
    };
    let request = build_request(product, &query)?;
    let include_stations = flag(query.debug_stations.as_deref()).unwrap_or(false);
    let cap = cell_cap_for_zoom(zoom);

    let cfg = state.cfg.clone();
    let body = tokio::task::spawn_blocking(move || {
        let output = run_pipeline(&cfg, &request)?;
        let viewport = viewport.unwrap_or(output.geometry.bbox);
        let selection = select_cells(&output, &viewport, cap)?;
        Ok::<_, ApiError>(grid_response(
            output,
            &request,
            zoom,
            viewport,
            selection.bbox_effective,
            selection.cells,
            cap,
            include_stations,
        ))
    })
    .await
    .map_err(|error| ApiError::Internal(format!("Grid task failed: {error}")))??;

    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

pub async fn point(
    State(state): State<AppState>,
    query: Result<Query<PointQuery>, QueryRejection>,
) -> Result<Json<PointAssessment>, ApiError> {
    let Query(query) = query?;
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lon) {
        return Err(ApiError::BadRequest(
            "Invalid lat/lon query parameters.".to_string(),
        ));
    }
    let hour = query.hour.unwrap_or(0);
    if hour > MAX_HOUR_OFFSET {
        return Err(ApiError::BadRequest(format!(
            "Hour offset must be between 0 and {MAX_HOUR_OFFSET}."
        )));
    }
    let pollutants = parse_pollutants(query.pollutants.as_deref())?;

    let source = CellSource::from_config(state.cfg.clone(), state.http.clone());
    let assessment = assess_point(
        &source,
        query.lat,
        query.lon,
        &pollutants,
        hour,
        state.cfg.point_timeout,
        Utc::now(),
    )
    .await;
    Ok(Json(assessment))
}

fn parse_product(raw: &str) -> Result<Product, ApiError> {
    Product::from_str(raw).map_err(ApiError::BadRequest)
}

fn parse_zoom(raw: &str) -> Result<u8, ApiError> {
    let zoom = raw
        .trim()
        .parse::<u8>()
        .map_err(|_| ApiError::BadRequest(format!("Invalid zoom '{raw}'.")))?;
    validate_zoom(zoom)
}

fn parse_pollutants(raw: Option<&str>) -> Result<Vec<Product>, ApiError> {
    let names: Vec<&str> = match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => raw.split(',').map(str::trim).filter(|name| !name.is_empty()).collect(),
        None => DEFAULT_POINT_POLLUTANTS.to_vec(),
    };
    let mut products = Vec::new();
    for name in names {
        let product = parse_product(name)?;
        if !products.contains(&product) {
            products.push(product);
        }
    }
    if products.is_empty() {
        return Err(ApiError::BadRequest("No pollutants requested.".to_string()));
    }
    Ok(products)
}

fn parse_bbox(raw: &str) -> Result<Bbox, ApiError> {
    let values: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ApiError::BadRequest(format!("Invalid bbox '{raw}'.")))?;
    Bbox::from_slice(&values)
        .filter(Bbox::is_well_formed)
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "Invalid bbox '{raw}': expected south,north,west,east."
            ))
        })
}

fn flag(raw: Option<&str>) -> Option<bool> {
    raw.map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn positive(value: Option<f64>, default: f64, name: &str) -> Result<f64, ApiError> {
    match value {
        None => Ok(default),
        Some(value) if value.is_finite() && value > 0.0 => Ok(value),
        Some(_) => Err(ApiError::BadRequest(format!("{name} must be a positive number."))),
    }
}

fn build_request(product: Product, query: &GridQuery) -> Result<PipelineRequest, ApiError> {
    let spec = product.spec();
    let time = validate_time(query.hour, query.gid.as_deref())?;
    let domain = parse_domain(query.domain.as_deref(), &spec).map_err(ApiError::BadRequest)?;

    let meteo = MeteoOptions {
        wind: flag(query.wind.as_deref())
            .unwrap_or(false)
            .then(FactorParams::wind_default),
        blh: flag(query.blh.as_deref())
            .unwrap_or(false)
            .then(FactorParams::blh_default),
    };

    let fusion = if flag(query.stations.as_deref()).unwrap_or(false) {
        let defaults = FusionParams::default();
        Some(FusionParams {
            radius_km: positive(query.radius_km, defaults.radius_km, "radius_km")?,
            power: positive(query.power, defaults.power, "power")?,
            max_age_h: positive(query.max_age_h, defaults.max_age_h, "max_age_h")?,
            w_max: match query.w_max {
                None => defaults.w_max,
                Some(value) if (0.0..=1.0).contains(&value) => value,
                Some(_) => {
                    return Err(ApiError::BadRequest(
                        "w_max must be between 0 and 1.".to_string(),
                    ))
                }
            },
            auto_scale: flag(query.auto_scale.as_deref()).unwrap_or(defaults.auto_scale),
            force: flag(query.force.as_deref()).unwrap_or(defaults.force),
        })
    } else {
        None
    };

    Ok(PipelineRequest {
        product,
        time,
        meteo,
        fusion,
        domain,
        now: Utc::now(),
    })
}

fn raster_cache_key(
    request: &PipelineRequest,
    query: &GridQuery,
    zoom: u8,
    palette: Palette,
    stamp: Option<i64>,
) -> String {
    let fusion = request
        .fusion
        .map(|params| params.cache_key())
        .unwrap_or_else(|| "off".to_string());
    // Forecast tiles depend on the wall-clock hour as well as the source snapshot.
    let clock = match request.time {
        GridTime::Hour(hour) if hour > 0 || request.fusion.is_some() => {
            request.now.format("%Y%m%d%H").to_string()
        }
        _ => String::new(),
    };
    format!(
        "{}|{}|z{}|{}|{}|{}|w{}b{}|{}|{}",
        request.product,
        request.time.cache_key(),
        zoom,
        palette.as_str(),
        query.domain.as_deref().unwrap_or("auto"),
        fusion,
        u8::from(request.meteo.wind.is_some()),
        u8::from(request.meteo.blh.is_some()),
        stamp.unwrap_or(0),
        clock
    )
}

fn raster_response(
    raster: &RenderedRaster,
    request_headers: &HeaderMap,
    ttl_seconds: u64,
) -> Response {
    let headers = raster_headers(raster, ttl_seconds);
    if etag_matches(request_headers, &raster.etag) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }
    (headers, raster.png.clone()).into_response()
}

#[allow(clippy::too_many_arguments)]
fn grid_response(
    output: PipelineOutput,
    request: &PipelineRequest,
    zoom: u8,
    bbox_requested: Bbox,
    bbox_effective: Option<Bbox>,
    cells: Vec<GridCell>,
    cap: usize,
    include_stations: bool,
) -> GridResponse {
    let gid = match &request.time {
        GridTime::Granule(gid) => Some(gid.clone()),
        GridTime::Hour(_) => None,
    };
    GridResponse {
        product: request.product,
        unit: output.unit,
        hour: request.time.hour_offset(),
        gid,
        zoom,
        bbox_requested,
        bbox_effective,
        domain: output.domain,
        stats: output.stats,
        cell_count: cells.len(),
        cap,
        cells,
        diagnostics: output.diagnostics,
        stations: include_stations.then_some(output.stations),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::domain::DomainMode;
    use crate::storage::fixtures::{latest_json, write_json};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    #[test]
    fn bbox_parsing() {
        assert_eq!(
            parse_bbox("39.5, 40.5,-75.5,-74.5").unwrap(),
            Bbox {
                south: 39.5,
                north: 40.5,
                west: -75.5,
                east: -74.5
            }
        );
        assert!(parse_bbox("40,39,-75,-74").is_err());
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
    }

    #[tokio::test]
    async fn meta_reports_grid_header_and_hod_slices() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::with_data_root(dir.path());
        write_json(
            &cfg.fc_support_dir(Product::No2).join("latest.json"),
            &latest_json(json!([[1.0, 2.0], [3.0, 4.0]]), json!([[0.0, 0.0], [0.0, 0.0]])),
        );
        for hour in [0, 1, 2] {
            write_json(
                &cfg.hod_dir(Product::No2).join(format!("hour_{hour:02}.json")),
                &json!({"hour": hour, "data": [[1.0, 1.0], [1.0, 1.0]]}),
            );
        }
        let state = AppState {
            cfg: Arc::new(cfg),
            http: reqwest::Client::new(),
            raster_cache: Arc::new(RwLock::new(HashMap::new())),
        };

        let Json(response) = meta(State(state)).await.unwrap();
        let no2 = &response.products[0];
        assert_eq!(no2.product, Product::No2);
        assert_eq!(no2.shape, Some([2, 2]));
        assert_eq!(no2.bbox.map(|bbox| bbox.as_array()), Some([0.0, 1.0, 0.0, 1.0]));
        assert_eq!(no2.unit, "molec/cm^2");
        assert_eq!(no2.hod_slices, 3);
        assert!(no2.latest_available);
        let hcho = &response.products[1];
        assert_eq!(hcho.shape, None);
        assert_eq!(hcho.hod_slices, 0);
        assert!(!hcho.latest_available);
    }

    #[test]
    fn zoom_segment_parsing() {
        assert_eq!(parse_zoom("5").unwrap(), 5);
        assert!(matches!(parse_zoom("300"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_zoom("abc"), Err(ApiError::BadRequest(_))));
        assert!(parse_zoom("2").is_err());
    }

    #[test]
    fn malformed_point_query_is_a_json_client_error() {
        let uri: axum::http::Uri = "/v1/point?lon=-75".parse().unwrap();
        let rejection = Query::<PointQuery>::try_from_uri(&uri).unwrap_err();
        let response = ApiError::from(rejection).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn pollutant_list_defaults_and_dedups() {
        assert_eq!(
            parse_pollutants(None).unwrap(),
            vec![Product::No2, Product::Hcho, Product::O3tot]
        );
        assert_eq!(
            parse_pollutants(Some("o3, no2,o3tot")).unwrap(),
            vec![Product::O3tot, Product::No2]
        );
        assert!(parse_pollutants(Some("pm25")).is_err());
    }

    #[test]
    fn request_building_applies_toggles() {
        let query = GridQuery {
            hour: Some(3),
            wind: Some("1".into()),
            stations: Some("true".into()),
            radius_km: Some(25.0),
            domain: Some("1e15,5e15".into()),
            ..GridQuery::default()
        };
        let request = build_request(Product::No2, &query).unwrap();
        assert_eq!(request.time, GridTime::Hour(3));
        assert!(request.meteo.wind.is_some());
        assert!(request.meteo.blh.is_none());
        let fusion = request.fusion.unwrap();
        assert_eq!(fusion.radius_km, 25.0);
        assert!(fusion.auto_scale);
        assert_eq!(
            request.domain,
            DomainMode::Fixed {
                min: 1e15,
                max: 5e15
            }
        );
    }

    #[test]
    fn invalid_requests_are_client_errors() {
        let bad_hour = GridQuery {
            hour: Some(13),
            ..GridQuery::default()
        };
        assert!(matches!(
            build_request(Product::No2, &bad_hour),
            Err(ApiError::BadRequest(_))
        ));
        let gid_with_hour = GridQuery {
            hour: Some(1),
            gid: Some("G1".into()),
            ..GridQuery::default()
        };
        assert!(build_request(Product::No2, &gid_with_hour).is_err());
        let bad_domain = GridQuery {
            domain: Some("5,1".into()),
            ..GridQuery::default()
        };
        assert!(build_request(Product::No2, &bad_domain).is_err());
        let bad_weight = GridQuery {
            stations: Some("1".into()),
            w_max: Some(2.0),
            ..GridQuery::default()
        };
        assert!(build_request(Product::No2, &bad_weight).is_err());
    }
}
