use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::render::RasterCacheEntry;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub http: Client,
    pub raster_cache: Arc<RwLock<HashMap<String, RasterCacheEntry>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    No2,
    Hcho,
    O3tot,
    Cldo4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Palette {
    Viridis,
    Gray,
}

#[derive(Clone, Copy, Debug)]
pub struct ProductSpec {
    pub product: Product,
    pub unit: &'static str,
    pub cap: f64,
    pub allow_zero: bool,
    pub q_low: f64,
    pub q_high: f64,
    pub palette: Palette,
    pub station_param: Option<&'static str>,
}

impl Product {
    pub const ALL: [Product; 4] = [Product::No2, Product::Hcho, Product::O3tot, Product::Cldo4];

    pub fn as_str(self) -> &'static str {
        match self {
            Product::No2 => "no2",
            Product::Hcho => "hcho",
            Product::O3tot => "o3tot",
            Product::Cldo4 => "cldo4",
        }
    }

    pub fn spec(self) -> ProductSpec {
        match self {
            Product::No2 => ProductSpec {
                product: self,
                unit: "molec/cm^2",
                cap: 1.2e16,
                allow_zero: false,
                q_low: 0.10,
                q_high: 0.98,
                palette: Palette::Viridis,
                station_param: Some("no2"),
            },
            Product::Hcho => ProductSpec {
                product: self,
                unit: "molec/cm^2",
                cap: 1.0e16,
                allow_zero: false,
                q_low: 0.10,
                q_high: 0.98,
                palette: Palette::Viridis,
                station_param: None,
            },
            Product::O3tot => ProductSpec {
                product: self,
                unit: "DU",
                cap: 700.0,
                allow_zero: false,
                q_low: 0.05,
                q_high: 0.98,
                palette: Palette::Viridis,
                station_param: Some("o3"),
            },
            Product::Cldo4 => ProductSpec {
                product: self,
                unit: "fraction",
                cap: 1.0,
                allow_zero: true,
                q_low: 0.0,
                q_high: 0.98,
                palette: Palette::Gray,
                station_param: None,
            },
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Product {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no2" => Ok(Product::No2),
            "hcho" => Ok(Product::Hcho),
            "o3tot" | "o3" => Ok(Product::O3tot),
            "cldo4" | "cloud" => Ok(Product::Cldo4),
            other => Err(format!("Unknown product '{other}'")),
        }
    }
}

impl Palette {
    pub fn as_str(self) -> &'static str {
        match self {
            Palette::Viridis => "viridis",
            Palette::Gray => "gray",
        }
    }
}

impl FromStr for Palette {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viridis" => Ok(Palette::Viridis),
            "gray" | "grey" => Ok(Palette::Gray),
            other => Err(format!("Unknown palette '{other}'")),
        }
    }
}

impl ProductSpec {
    pub fn is_valid(&self, value: f64) -> bool {
        value.is_finite() && (self.allow_zero || value > 0.0)
    }

    /// Finite, allowZero-respecting values clamped into `[0, cap]`; everything else is NaN.
    pub fn sanitize(&self, value: f64) -> f64 {
        if self.is_valid(value) {
            value.clamp(0.0, self.cap)
        } else {
            f64::NAN
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl Bbox {
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        if values.len() != 4 || values.iter().any(|value| !value.is_finite()) {
            return None;
        }
        Some(Self {
            south: values[0],
            north: values[1],
            west: values[2],
            east: values[3],
        })
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.south, self.north, self.west, self.east]
    }

    pub fn is_well_formed(&self) -> bool {
        self.as_array().iter().all(|value| value.is_finite())
            && self.south <= self.north
            && self.west <= self.east
            && self.south >= -90.0
            && self.north <= 90.0
            && self.west >= -180.0
            && self.east <= 180.0
    }

    pub fn intersect(&self, other: &Bbox) -> Option<Bbox> {
        let clipped = Bbox {
            south: self.south.max(other.south),
            north: self.north.min(other.north),
            west: self.west.max(other.west),
            east: self.east.min(other.east),
        };
        (clipped.south <= clipped.north && clipped.west <= clipped.east).then_some(clipped)
    }

    pub fn approx_eq(&self, other: &Bbox, tolerance: f64) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .all(|(left, right)| (left - right).abs() <= tolerance)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GridGeometry {
    pub bbox: Bbox,
    pub height: usize,
    pub width: usize,
    pub grid_deg: f64,
}

impl GridGeometry {
    pub fn lat_step(&self) -> f64 {
        if self.height > 1 {
            (self.bbox.north - self.bbox.south) / (self.height - 1) as f64
        } else {
            0.0
        }
    }

    pub fn lon_step(&self) -> f64 {
        if self.width > 1 {
            (self.bbox.east - self.bbox.west) / (self.width - 1) as f64
        } else {
            0.0
        }
    }

    /// Row 0 is the southern edge.
    pub fn lat_at_row(&self, row: usize) -> f64 {
        self.bbox.south + self.lat_step() * row as f64
    }

    pub fn lon_at_col(&self, col: usize) -> f64 {
        self.bbox.west + self.lon_step() * col as f64
    }

    pub fn column_longitudes(&self) -> Vec<f64> {
        let step = self.lon_step();
        (0..self.width)
            .map(|col| self.bbox.west + step * col as f64)
            .collect()
    }

    pub fn row_latitudes(&self) -> Vec<f64> {
        let step = self.lat_step();
        (0..self.height)
            .map(|row| self.bbox.south + step * row as f64)
            .collect()
    }

    pub fn matches(&self, bbox: &Bbox, height: usize, width: usize, tolerance: f64) -> bool {
        self.height == height && self.width == width && self.bbox.approx_eq(bbox, tolerance)
    }

    pub fn nearest_cell(&self, lat: f64, lon: f64) -> Option<(usize, usize)> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let bbox = &self.bbox;
        let half_lat = self.lat_step() / 2.0;
        let half_lon = self.lon_step() / 2.0;
        if lat < bbox.south - half_lat
            || lat > bbox.north + half_lat
            || lon < bbox.west - half_lon
            || lon > bbox.east + half_lon
        {
            return None;
        }
        let row = index_for(lat - bbox.south, self.lat_step(), self.height);
        let col = index_for(lon - bbox.west, self.lon_step(), self.width);
        Some((row, col))
    }
}

fn index_for(offset: f64, step: f64, len: usize) -> usize {
    if step <= 0.0 || len <= 1 {
        return 0;
    }
    ((offset / step).round().max(0.0) as usize).min(len - 1)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValueGrid {
    pub height: usize,
    pub width: usize,
    pub values: Vec<f64>,
}

impl ValueGrid {
    pub fn filled(height: usize, width: usize, value: f64) -> Self {
        Self {
            height,
            width,
            values: vec![value; height * width],
        }
    }

    pub fn nan(height: usize, width: usize) -> Self {
        Self::filled(height, width, f64::NAN)
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != width) {
            return None;
        }
        Some(Self {
            height,
            width,
            values: rows.into_iter().flatten().collect(),
        })
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[self.index(row, col)]
    }

    pub fn same_shape(&self, other: &ValueGrid) -> bool {
        self.height == other.height && self.width == other.width
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StationPoint {
    pub lat: f64,
    pub lon: f64,
    pub val: f64,
    pub age_h: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStrategy {
    Auto,
    Fixed,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayDomain {
    pub strategy: DomainStrategy,
    pub min: f64,
    pub max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub lat: f64,
    pub lon: f64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<f64>,
}
