// src/pac/downloader.rs
use crate::{log_debug, log_error, log_info};
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("only http:// and https:// PAC locations are supported: {0}")]
    UnsupportedScheme(String),
    #[error("HTTP request for PAC script failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("PAC download failed: HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("reading PAC script body failed: {0}")]
    Read(std::io::Error),
    #[error("PAC script is larger than {limit} bytes")]
    TooLarge { limit: usize },
    #[error("no WPAD script found for {0}")]
    NotFound(String),
}

pub fn download_pac(pac_url: &str, timeout: Duration, max_bytes: usize) -> Result<String, FetchError> {
    let scheme = url::Url::parse(pac_url)
        .map(|u| u.scheme().to_ascii_lowercase())
        .unwrap_or_default();
    if scheme != "http" && scheme != "https" {
        return Err(FetchError::UnsupportedScheme(pac_url.to_string()));
    }

    log_info!("Downloading PAC script from: {}", pac_url);

    let client = Client::builder().timeout(timeout).build()?;
    let response = client.get(pac_url).send()?;

    if !response.status().is_success() {
        log_error!("PAC download failed: HTTP {}", response.status());
        return Err(FetchError::Status(response.status()));
    }
    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Err(FetchError::TooLarge { limit: max_bytes });
    }

    let text = read_capped(response, max_bytes)?;
    log_info!("PAC script downloaded successfully ({} bytes)", text.len());
    Ok(text)
}

/// Reads at most `max_bytes`; one byte more means the body is too large.
fn read_capped<R: Read>(body: R, max_bytes: usize) -> Result<String, FetchError> {
    let mut buf = Vec::new();
    body.take(max_bytes as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(FetchError::Read)?;
    if buf.len() > max_bytes {
        return Err(FetchError::TooLarge { limit: max_bytes });
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// WPAD locations to probe for `fqdn`, most specific first.
///
/// `pc.dept.example.com` yields `wpad.pc.dept.example.com`, `wpad.dept.example.com`
/// and `wpad.example.com`; a bare top-level label is never probed.
pub fn wpad_candidate_urls(fqdn: &str) -> Vec<String> {
    let fqdn = fqdn.trim().trim_end_matches('.').to_ascii_lowercase();
    if fqdn.is_empty() || fqdn == "localhost" || fqdn.starts_with(|c: char| c.is_ascii_digit()) {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    let mut name = fqdn.as_str();
    while let Some((_, rest)) = name.split_once('.') {
        candidates.push(format!("http://wpad.{name}/wpad.dat"));
        name = rest;
    }
    candidates
}

/// Probes the WPAD candidates for `fqdn` in order; returns the first script found.
pub fn discover_wpad(fqdn: &str, timeout: Duration, max_bytes: usize) -> Result<(String, String), FetchError> {
    for candidate in wpad_candidate_urls(fqdn) {
        match download_pac(&candidate, timeout, max_bytes) {
            Ok(script) => return Ok((candidate, script)),
            Err(e) => log_debug!("No wpad.dat at {}: {}", candidate, e),
        }
    }
    Err(FetchError::NotFound(fqdn.to_string()))
}
