//! Spindle I/O modules
//!
//! Login is a seed/digest handshake on the web config page:
//! 1. GET `/config` and read the hidden `seeddata` input
//! 2. POST `seeddata` and `authdata = md5("<seed>:<user>:<pass>")` to `/config/index.html`
//! 3. The session is the last cookie set by that response
//!
//! Counters are read from `/di_value/slot_0` with the session passed as
//! the `adamsessionid` cookie.

use async_trait::async_trait;
use md5::{Digest, Md5};
use regex::Regex;
use reqwest::header::{COOKIE, SET_COOKIE};
use sensorfleet_core::{AuthStrategy, Credential, ScrapeStrategy, StrategyError};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Registry key for both spindle strategies
pub const SPINDLE_STRATEGY: &str = "spindle_device";

const SESSION_COOKIE: &str = "adamsessionid";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum VendorError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Deserialize)]
struct DiValues {
    #[serde(rename = "DIVal")]
    di_val: Vec<DiValue>,
}

#[derive(Deserialize)]
struct DiValue {
    #[serde(rename = "Val")]
    val: i64,
}

/// Auth and scrape strategy for spindle devices
pub struct SpindleDevice {
    client: reqwest::Client,
    port: u16,
    seed_input: Regex,
    value_attr: Regex,
}

impl SpindleDevice {
    pub fn new() -> Result<Self, VendorError> {
        Self::with_port(80)
    }

    /// Talk to devices on a non-standard HTTP port
    pub fn with_port(port: u16) -> Result<Self, VendorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            port,
            seed_input: Regex::new(r#"(?is)<input\b[^>]*\bname\s*=\s*["']seeddata["'][^>]*>"#)?,
            value_attr: Regex::new(r#"(?is)\bvalue\s*=\s*["']([^"']*)["']"#)?,
        })
    }

    fn base_url(&self, address: IpAddr) -> String {
        match address {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.port),
        }
    }

    /// Pull the value of the `seeddata` input out of the config page
    fn extract_seed(&self, html: &str) -> Option<String> {
        let tag = self.seed_input.find(html)?;
        let value = self.value_attr.captures(tag.as_str())?.get(1)?;
        Some(value.as_str().to_string())
    }
}

fn request_error(e: reqwest::Error) -> StrategyError {
    StrategyError::Request(e.to_string())
}

/// Hex MD5 over "<seed>:<username>:<password>"
pub fn auth_digest(seed: &str, credential: &Credential) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", seed, credential.username, credential.password));
    hex::encode(hasher.finalize())
}

/// Value of the last cookie among `Set-Cookie` header values
fn last_cookie_value<'a>(headers: impl Iterator<Item = &'a str>) -> Option<String> {
    headers
        .filter_map(|header| {
            let pair = header.split(';').next()?;
            let (_, value) = pair.split_once('=')?;
            Some(value.trim().to_string())
        })
        .last()
}

fn parse_readings(body: &str) -> Result<Vec<i64>, StrategyError> {
    let parsed: DiValues =
        serde_json::from_str(body).map_err(|e| StrategyError::InvalidResponse(e.to_string()))?;
    Ok(parsed.di_val.into_iter().map(|v| v.val).collect())
}

#[async_trait]
impl AuthStrategy for SpindleDevice {
    async fn authenticate(
        &self,
        address: IpAddr,
        credential: &Credential,
    ) -> Result<String, StrategyError> {
        let config_url = format!("{}/config", self.base_url(address));

        let page = self
            .client
            .get(&config_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?
            .text()
            .await
            .map_err(request_error)?;

        let seed = self.extract_seed(&page).ok_or_else(|| {
            StrategyError::InvalidResponse("seeddata not found in config page".into())
        })?;
        let digest = auth_digest(&seed, credential);
        debug!(%address, username = %credential.username, "Submitting spindle login");

        let response = self
            .client
            .post(format!("{}/index.html", config_url))
            .form(&[("seeddata", seed.as_str()), ("authdata", digest.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?;

        let cookie = last_cookie_value(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );

        match cookie {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(StrategyError::EmptyToken),
        }
    }
}

#[async_trait]
impl ScrapeStrategy for SpindleDevice {
    async fn scrape(&self, address: IpAddr, token: &str) -> Result<Vec<i64>, StrategyError> {
        let url = format!("{}/di_value/slot_0", self.base_url(address));

        let body = self
            .client
            .get(&url)
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, token))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?
            .text()
            .await
            .map_err(request_error)?;

        let readings = parse_readings(&body)?;
        debug!(%address, fields = readings.len(), "Scraped spindle counters");
        Ok(readings)
    }
}
