use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::types::{Bbox, Product};

pub async fn fetch_json<T: DeserializeOwned>(http: &Client, url: &str) -> Result<T> {
    let response = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request failed for {url}"))?;

    if !response.status().is_success() {
        bail!("Request failed ({}) for {url}", response.status());
    }

    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to decode JSON body for {url}"))
}

pub fn cell_grid_url(base_url: &str, product: Product, hour: u32, bbox: &Bbox, zoom: u8) -> String {
    let bbox = format!("{},{},{},{}", bbox.south, bbox.north, bbox.west, bbox.east);
    format!(
        "{}/v1/grid/{}?hour={hour}&z={zoom}&bbox={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(product.as_str()),
        urlencoding::encode(&bbox)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_grid_url_encodes_bbox() {
        let bbox = Bbox {
            south: 39.5,
            north: 40.5,
            west: -75.5,
            east: -74.5,
        };
        assert_eq!(
            cell_grid_url("http://peer:9292/", Product::O3tot, 2, &bbox, 10),
            "http://peer:9292/v1/grid/o3tot?hour=2&z=10&bbox=39.5%2C40.5%2C-75.5%2C-74.5"
        );
    }
}
