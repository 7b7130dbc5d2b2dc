pub const TEMPO_DIR: &str = "tempo";
pub const FC_SUPPORT_DIR: &str = "fc_support";
pub const HOD_DIR: &str = "hod";
pub const GRANULE_JSON_DIR: &str = "json";
pub const METEO_DIR: &str = "weather/meteo/json";
pub const STATIONS_DIR: &str = "stations";

pub const HOURS_PER_DAY: usize = 24;
pub const SECONDS_PER_DAY: f64 = 86_400.0;
pub const SECONDS_PER_HOUR: f64 = 3_600.0;
pub const MAX_HOUR_OFFSET: u32 = 12;

pub const HOD_EPSILON: f64 = 1e-9;
pub const HOD_RATIO_MIN: f64 = 0.33;
pub const HOD_RATIO_MAX: f64 = 3.0;

pub const METEO_EPSILON: f64 = 1e-6;
pub const METEO_BBOX_TOLERANCE_DEG: f64 = 1e-6;
pub const DEFAULT_BETA_WIND: f64 = -0.35;
pub const DEFAULT_WS0_MPS: f64 = 3.0;
pub const DEFAULT_BETA_BLH: f64 = -0.30;
pub const DEFAULT_BLH0_M: f64 = 800.0;
pub const DEFAULT_METEO_FACTOR_MIN: f64 = 0.6;
pub const DEFAULT_METEO_FACTOR_MAX: f64 = 1.4;

pub const KM_PER_DEGREE: f64 = 111.32;
pub const EARTH_RADIUS_KM: f64 = 6_371.0;
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
pub const IDW_NEAR_ZERO_KM: f64 = 1e-3;
pub const IDW_NEAR_ZERO_WEIGHT: f64 = 1e12;
pub const IDW_FULL_COVERAGE_STATIONS: f64 = 3.0;
pub const IDW_MIN_COVERAGE_WEIGHT: f64 = 0.25;
pub const DEFAULT_FUSION_RADIUS_KM: f64 = 60.0;
pub const DEFAULT_FUSION_POWER: f64 = 2.0;
pub const DEFAULT_FUSION_MAX_AGE_H: f64 = 3.0;
pub const DEFAULT_FUSION_W_MAX: f64 = 0.6;
pub const SPARSE_AUTO_SCALE_SAMPLES: usize = 5;
pub const STATION_DEDUP_DECIMALS: i32 = 4;

pub const DOMAIN_EPSILON_REL: f64 = 1e-9;
pub const DOMAIN_MIN_SPAN_CAP_FRACTION: f64 = 0.01;
pub const DOMAIN_MIN_SPAN_RANGE_FRACTION: f64 = 0.05;

pub const MIN_ZOOM: u8 = 3;
pub const MAX_ZOOM: u8 = 12;
pub const MAX_RASTER_ZOOM: u8 = 7;
pub const RASTER_BASE_WIDTH: u32 = 512;
pub const PALETTE_BINS: usize = 32;
pub const PALETTE_LOW_ALPHA: [u8; 3] = [40, 90, 150];
pub const PALETTE_ALPHA: u8 = 215;

pub const POINT_QUERY_HALF_SPAN_DEG: f64 = 0.5;
pub const POINT_QUERY_ZOOM: u8 = 10;
pub const DEFAULT_POINT_POLLUTANTS: [&str; 3] = ["no2", "hcho", "o3tot"];

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9292";
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/climatewise";
pub const DEFAULT_READ_ATTEMPTS: u64 = 3;
pub const DEFAULT_READ_RETRY_MS: u64 = 75;
pub const DEFAULT_POINT_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_RASTER_CACHE_TTL_SECONDS: u64 = 120;
pub const DEFAULT_RASTER_CACHE_MAX_ENTRIES: u64 = 256;

pub fn cell_cap_for_zoom(zoom: u8) -> usize {
    match zoom {
        0..=7 => 60_000,
        8..=9 => 30_000,
        _ => 15_000,
    }
}
