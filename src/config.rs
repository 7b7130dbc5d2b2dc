use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::{
    DEFAULT_DATA_ROOT, DEFAULT_LISTEN_ADDR, DEFAULT_POINT_TIMEOUT_MS,
    DEFAULT_RASTER_CACHE_MAX_ENTRIES, DEFAULT_RASTER_CACHE_TTL_SECONDS, DEFAULT_READ_ATTEMPTS,
    DEFAULT_READ_RETRY_MS, DEFAULT_REQUEST_TIMEOUT_SECONDS, FC_SUPPORT_DIR, GRANULE_JSON_DIR,
    HOD_DIR, METEO_DIR, STATIONS_DIR, TEMPO_DIR,
};
use crate::types::Product;

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: String,
    pub data_root: PathBuf,
    pub read_policy: ReadPolicy,
    pub point_timeout: Duration,
    pub point_upstream_url: Option<String>,
    pub request_timeout: Duration,
    pub raster_cache_ttl: Duration,
    pub raster_cache_max_entries: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ReadPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_READ_ATTEMPTS as u32,
            retry_delay: Duration::from_millis(DEFAULT_READ_RETRY_MS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_string("GRID_LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let data_root = PathBuf::from(env_string("GRID_DATA_ROOT", DEFAULT_DATA_ROOT));
        let read_policy = ReadPolicy {
            attempts: env_u64("GRID_READ_ATTEMPTS", DEFAULT_READ_ATTEMPTS)?.max(1) as u32,
            retry_delay: Duration::from_millis(env_u64(
                "GRID_READ_RETRY_MS",
                DEFAULT_READ_RETRY_MS,
            )?),
        };
        let point_timeout = Duration::from_millis(env_u64(
            "GRID_POINT_TIMEOUT_MS",
            DEFAULT_POINT_TIMEOUT_MS,
        )?);
        let point_upstream_url =
            env_optional("GRID_POINT_UPSTREAM_URL").map(|value| trim_base_url(&value));
        let request_timeout = Duration::from_secs(env_u64(
            "GRID_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?);
        let raster_cache_ttl = Duration::from_secs(env_u64(
            "GRID_RASTER_CACHE_TTL_SECONDS",
            DEFAULT_RASTER_CACHE_TTL_SECONDS,
        )?);
        let raster_cache_max_entries = env_u64(
            "GRID_RASTER_CACHE_MAX_ENTRIES",
            DEFAULT_RASTER_CACHE_MAX_ENTRIES,
        )? as usize;

        Ok(Self {
            listen_addr,
            data_root,
            read_policy,
            point_timeout,
            point_upstream_url,
            request_timeout,
            raster_cache_ttl,
            raster_cache_max_entries,
        })
    }

    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            data_root: data_root.into(),
            read_policy: ReadPolicy::default(),
            point_timeout: Duration::from_millis(DEFAULT_POINT_TIMEOUT_MS),
            point_upstream_url: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            raster_cache_ttl: Duration::from_secs(DEFAULT_RASTER_CACHE_TTL_SECONDS),
            raster_cache_max_entries: DEFAULT_RASTER_CACHE_MAX_ENTRIES as usize,
        }
    }

    pub fn product_dir(&self, product: Product) -> PathBuf {
        self.data_root.join(TEMPO_DIR).join(product.as_str())
    }

    pub fn fc_support_dir(&self, product: Product) -> PathBuf {
        self.product_dir(product).join(FC_SUPPORT_DIR)
    }

    pub fn hod_dir(&self, product: Product) -> PathBuf {
        self.fc_support_dir(product).join(HOD_DIR)
    }

    pub fn granule_dir(&self, product: Product) -> PathBuf {
        self.product_dir(product).join(GRANULE_JSON_DIR)
    }

    pub fn meteo_dir(&self) -> PathBuf {
        self.data_root.join(METEO_DIR)
    }

    pub fn station_hours_dir(&self, param: &str) -> PathBuf {
        self.data_root
            .join(STATIONS_DIR)
            .join(param)
            .join("json")
            .join("hours")
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("Failed to parse {}={} as u64", name, value)),
        Err(_) => Ok(default),
    }
}

fn trim_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}
