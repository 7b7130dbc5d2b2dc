use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::{cell_cap_for_zoom, POINT_QUERY_HALF_SPAN_DEG, POINT_QUERY_ZOOM};
use crate::domain::{normalize, DomainMode};
use crate::http_client::{cell_grid_url, fetch_json};
use crate::meteo::MeteoOptions;
use crate::pipeline::{run_pipeline, GridTime, PipelineRequest};
use crate::render::select_cells;
use crate::types::{Bbox, DisplayDomain, GridCell, Product};
use crate::utils::haversine_km;

const CONDITION_WEIGHTS: [(&str, [(Product, f64); 3]); 5] = [
    (
        "asthma",
        [(Product::No2, 0.50), (Product::O3tot, 0.40), (Product::Hcho, 0.10)],
    ),
    (
        "copd",
        [(Product::No2, 0.40), (Product::O3tot, 0.40), (Product::Hcho, 0.20)],
    ),
    (
        "cardiovascular",
        [(Product::No2, 0.55), (Product::O3tot, 0.20), (Product::Hcho, 0.25)],
    ),
    (
        "children",
        [(Product::No2, 0.45), (Product::O3tot, 0.40), (Product::Hcho, 0.15)],
    ),
    (
        "elderly",
        [(Product::No2, 0.40), (Product::O3tot, 0.30), (Product::Hcho, 0.30)],
    ),
];

pub fn overall_weight(product: Product) -> f64 {
    match product {
        Product::No2 => 0.45,
        Product::O3tot => 0.35,
        Product::Hcho => 0.20,
        Product::Cldo4 => 0.0,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellGridResponse {
    pub unit: String,
    pub domain: DisplayDomain,
    pub cells: Vec<GridCell>,
}

#[derive(Clone)]
pub enum CellSource {
    Local(Arc<Config>),
    Remote { http: Client, base_url: String },
}

impl CellSource {
    pub fn from_config(cfg: Arc<Config>, http: Client) -> Self {
        match cfg.point_upstream_url.clone() {
            Some(base_url) => CellSource::Remote { http, base_url },
            None => CellSource::Local(cfg),
        }
    }

    pub async fn fetch(
        &self,
        product: Product,
        hour: u32,
        viewport: Bbox,
        now: DateTime<Utc>,
    ) -> Result<CellGridResponse> {
        match self {
            CellSource::Local(cfg) => {
                let cfg = cfg.clone();
                tokio::task::spawn_blocking(move || {
                    let request = PipelineRequest {
                        product,
                        time: GridTime::Hour(hour),
                        meteo: MeteoOptions {
                            wind: None,
                            blh: None,
                        },
                        fusion: None,
                        domain: DomainMode::Auto,
                        now,
                    };
                    let output = run_pipeline(&cfg, &request)?;
                    let selection =
                        select_cells(&output, &viewport, cell_cap_for_zoom(POINT_QUERY_ZOOM))?;
                    Ok::<_, anyhow::Error>(CellGridResponse {
                        unit: output.unit,
                        domain: output.domain,
                        cells: selection.cells,
                    })
                })
                .await
                .context("Point sub-request task failed")?
            }
            CellSource::Remote { http, base_url } => {
                let url = cell_grid_url(base_url, product, hour, &viewport, POINT_QUERY_ZOOM);
                fetch_json(http, &url).await
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Ok,
    NoData,
    Timeout,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct PollutantReading {
    pub status: ReadingStatus,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub score: Option<f64>,
    pub distance_km: Option<f64>,
    pub domain: Option<DisplayDomain>,
}

impl PollutantReading {
    fn missing(status: ReadingStatus) -> Self {
        Self {
            status,
            value: None,
            unit: None,
            score: None,
            distance_km: None,
            domain: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Good,
    Moderate,
    UnhealthySensitive,
    Unhealthy,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 3.0 {
            RiskLevel::Good
        } else if score <= 5.0 {
            RiskLevel::Moderate
        } else if score <= 7.0 {
            RiskLevel::UnhealthySensitive
        } else {
            RiskLevel::Unhealthy
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScoredLevel {
    pub score: f64,
    pub level: RiskLevel,
}

#[derive(Clone, Debug, Serialize)]
pub struct PointAssessment {
    pub lat: f64,
    pub lon: f64,
    pub hour: u32,
    pub pollutants: BTreeMap<String, PollutantReading>,
    pub overall: Option<ScoredLevel>,
    pub conditions: BTreeMap<String, Option<ScoredLevel>>,
}

pub fn point_viewport(lat: f64, lon: f64) -> Bbox {
    Bbox {
        south: (lat - POINT_QUERY_HALF_SPAN_DEG).max(-90.0),
        north: (lat + POINT_QUERY_HALF_SPAN_DEG).min(90.0),
        west: (lon - POINT_QUERY_HALF_SPAN_DEG).max(-180.0),
        east: (lon + POINT_QUERY_HALF_SPAN_DEG).min(180.0),
    }
}

pub fn score_nearest(lat: f64, lon: f64, response: &CellGridResponse) -> PollutantReading {
    let nearest = response
        .cells
        .iter()
        .filter(|cell| cell.value.is_finite())
        .map(|cell| (haversine_km(lat, lon, cell.lat, cell.lon), cell))
        .min_by(|left, right| left.0.total_cmp(&right.0));
    let Some((distance_km, cell)) = nearest else {
        return PollutantReading::missing(ReadingStatus::NoData);
    };
    PollutantReading {
        status: ReadingStatus::Ok,
        value: Some(cell.value),
        unit: Some(response.unit.clone()),
        score: Some(1.0 + 9.0 * normalize(cell.value, &response.domain)),
        distance_km: Some(distance_km),
        domain: Some(response.domain),
    }
}

pub fn weighted_score(
    readings: &BTreeMap<String, PollutantReading>,
    weights: &[(Product, f64)],
) -> Option<ScoredLevel> {
    let mut weight_sum = 0.0;
    let mut score_sum = 0.0;
    for (product, weight) in weights {
        let Some(score) = readings.get(product.as_str()).and_then(|reading| reading.score) else {
            continue;
        };
        if *weight <= 0.0 {
            continue;
        }
        weight_sum += weight;
        score_sum += weight * score;
    }
    (weight_sum > 0.0).then(|| {
        let score = score_sum / weight_sum;
        ScoredLevel {
            score,
            level: RiskLevel::from_score(score),
        }
    })
}

pub async fn assess_point(
    source: &CellSource,
    lat: f64,
    lon: f64,
    pollutants: &[Product],
    hour: u32,
    timeout: Duration,
    now: DateTime<Utc>,
) -> PointAssessment {
    let viewport = point_viewport(lat, lon);
    let tasks = pollutants.iter().map(|product| {
        let source = source.clone();
        let product = *product;
        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(timeout, source.fetch(product, hour, viewport, now)).await;
            (product, outcome)
        })
    });

    let mut readings = BTreeMap::new();
    for (index, result) in join_all(tasks).await.into_iter().enumerate() {
        let (product, reading) = match result {
            Ok((product, Ok(Ok(response)))) => (product, score_nearest(lat, lon, &response)),
            Ok((product, Ok(Err(error)))) => {
                debug!("Point sub-request for {product} failed: {error:#}");
                (product, PollutantReading::missing(ReadingStatus::Error))
            }
            Ok((product, Err(_))) => {
                warn!("Point sub-request for {product} timed out after {timeout:?}");
                (product, PollutantReading::missing(ReadingStatus::Timeout))
            }
            Err(error) => {
                warn!("Point sub-request task panicked: {error}");
                (
                    pollutants[index],
                    PollutantReading::missing(ReadingStatus::Error),
                )
            }
        };
        readings.insert(product.as_str().to_string(), reading);
    }

    let overall_weights: Vec<(Product, f64)> = Product::ALL
        .iter()
        .map(|product| (*product, overall_weight(*product)))
        .collect();
    let overall = weighted_score(&readings, &overall_weights);
    let conditions = CONDITION_WEIGHTS
        .iter()
        .map(|(name, weights)| (name.to_string(), weighted_score(&readings, weights)))
        .collect();

    PointAssessment {
        lat,
        lon,
        hour,
        pollutants: readings,
        overall,
        conditions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures::write_json;
    use crate::types::DomainStrategy;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn response(cells: Vec<GridCell>) -> CellGridResponse {
        CellGridResponse {
            unit: "DU".to_string(),
            domain: DisplayDomain {
                strategy: DomainStrategy::Auto,
                min: 200.0,
                max: 400.0,
            },
            cells,
        }
    }

    fn cell(lat: f64, lon: f64, value: f64) -> GridCell {
        GridCell {
            lat,
            lon,
            value,
            cloud: None,
        }
    }

    fn reading(score: f64) -> PollutantReading {
        PollutantReading {
            score: Some(score),
            ..PollutantReading::missing(ReadingStatus::Ok)
        }
    }

    #[test]
    fn nearest_cell_is_scored_against_its_domain() {
        let reading = score_nearest(
            40.0,
            -75.0,
            &response(vec![cell(40.4, -75.0, 400.0), cell(40.05, -75.0, 300.0)]),
        );
        assert_eq!(reading.status, ReadingStatus::Ok);
        assert_eq!(reading.value, Some(300.0));
        assert_eq!(reading.score, Some(5.5));
        assert!((reading.distance_km.unwrap() - 5.56).abs() < 0.01);
    }

    #[test]
    fn empty_cell_list_is_no_data() {
        let reading = score_nearest(0.0, 0.0, &response(Vec::new()));
        assert_eq!(reading.status, ReadingStatus::NoData);
        assert!(reading.score.is_none());
    }

    #[test]
    fn missing_pollutants_carry_no_weight() {
        let mut readings = BTreeMap::new();
        readings.insert("no2".to_string(), reading(8.0));
        readings.insert(
            "hcho".to_string(),
            PollutantReading::missing(ReadingStatus::Timeout),
        );
        let weights = [(Product::No2, 0.45), (Product::Hcho, 0.20)];
        let overall = weighted_score(&readings, &weights).unwrap();
        assert_eq!(overall.score, 8.0);
        assert_eq!(overall.level, RiskLevel::Unhealthy);
        assert!(weighted_score(&BTreeMap::new(), &weights).is_none());
    }

    #[test]
    fn risk_levels() {
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Good);
        assert_eq!(RiskLevel::from_score(3.0), RiskLevel::Good);
        assert_eq!(RiskLevel::from_score(4.2), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(7.0), RiskLevel::UnhealthySensitive);
        assert_eq!(RiskLevel::from_score(7.1), RiskLevel::Unhealthy);
    }

    async fn peer_grid(Path(product): Path<String>) -> Json<CellGridResponse> {
        if product != "no2" {
            std::future::pending::<()>().await;
        }
        Json(response(vec![cell(40.4, -74.6, 300.0)]))
    }

    #[tokio::test]
    async fn stalled_remote_pollutant_times_out_without_failing_the_rest() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route("/v1/grid/{product}", get(peer_grid));
            axum::serve(listener, app).await.unwrap();
        });
        let source = CellSource::Remote {
            http: Client::new(),
            base_url: format!("http://{addr}"),
        };
        let now = Utc.with_ymd_and_hms(2025, 10, 4, 12, 0, 0).unwrap();

        let assessment = assess_point(
            &source,
            40.4,
            -74.6,
            &[Product::No2, Product::Hcho],
            0,
            Duration::from_millis(300),
            now,
        )
        .await;

        let no2 = &assessment.pollutants["no2"];
        assert_eq!(no2.status, ReadingStatus::Ok);
        assert_eq!(no2.value, Some(300.0));
        assert_eq!(no2.score, Some(5.5));
        let hcho = &assessment.pollutants["hcho"];
        assert_eq!(hcho.status, ReadingStatus::Timeout);
        assert!(hcho.score.is_none());
        assert_eq!(assessment.overall.unwrap().score, 5.5);
    }

    #[tokio::test]
    async fn local_fan_out_degrades_per_pollutant() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::with_data_root(dir.path());
        write_json(
            &cfg.fc_support_dir(Product::No2).join("latest.json"),
            &json!({
                "unit": "molec/cm^2",
                "bbox": [39.5, 40.5, -75.5, -74.5],
                "shape": [2, 2],
                "data": {"value": [[1e15, 2e15], [3e15, 4e15]], "age_h": [[0, 0], [0, 0]]}
            }),
        );
        let source = CellSource::Local(Arc::new(cfg));
        let now = Utc.with_ymd_and_hms(2025, 10, 4, 12, 0, 0).unwrap();

        let assessment = assess_point(
            &source,
            40.4,
            -74.6,
            &[Product::No2, Product::Hcho],
            0,
            Duration::from_secs(5),
            now,
        )
        .await;

        let no2 = &assessment.pollutants["no2"];
        assert_eq!(no2.status, ReadingStatus::Ok);
        assert_eq!(no2.value, Some(4e15));
        assert_eq!(assessment.pollutants["hcho"].status, ReadingStatus::Error);
        let overall = assessment.overall.unwrap();
        assert_eq!(overall.score, no2.score.unwrap());
        assert_eq!(assessment.conditions.len(), 5);
    }
}
