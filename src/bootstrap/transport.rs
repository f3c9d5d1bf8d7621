use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

fn client(timeout_sec: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_sec))
        .build()
        .context("build HTTP client")
}

pub fn read_bytes_url(url: &str, timeout_sec: u64) -> Result<Vec<u8>> {
    let resp = client(timeout_sec)?
        .get(url)
        .send()
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url} returned error status"))?;
    Ok(resp.bytes().with_context(|| format!("read body {url}"))?.to_vec())
}

pub fn read_text_url(url: &str, timeout_sec: u64) -> Result<String> {
    let resp = client(timeout_sec)?
        .get(url)
        .send()
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url} returned error status"))?;
    resp.text().with_context(|| format!("read body {url}"))
}

pub fn read_json_url(url: &str, timeout_sec: u64) -> Result<Value> {
    let text = read_text_url(url, timeout_sec)?;
    serde_json::from_str(&text).with_context(|| format!("parse JSON from {url}"))
}
