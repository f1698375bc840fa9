//! Brute-force credential and strategy discovery
//!
//! Walks {credential pairs} x {auth strategies} x {scrape strategies} in
//! configuration/registration order and returns the first combination where
//! both an auth and a scrape strategy succeed. Every failure is final for that
//! combination within one call; callers retry by probing again later.

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::device::{Credential, DeviceId, DeviceRecord};
use crate::strategy::{AuthRegistry, ScrapeRegistry, StrategyError};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("No credentials configured")]
    NoCredentials,
    #[error("No working credential/strategy combination for {device} ({tried} credential pairs tried)")]
    Exhausted { device: DeviceId, tried: usize },
}

/// A complete working combination for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub credential: Credential,
    pub auth_strategy: String,
    pub scrape_strategy: String,
    pub token: String,
}

/// Searches the credential/strategy space for a device
pub struct CredentialProber {
    auth: Arc<AuthRegistry>,
    scrape: Arc<ScrapeRegistry>,
    credentials: Vec<Credential>,
}

impl CredentialProber {
    pub fn new(
        auth: Arc<AuthRegistry>,
        scrape: Arc<ScrapeRegistry>,
        credentials: Vec<Credential>,
    ) -> Self {
        Self {
            auth,
            scrape,
            credentials,
        }
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Find a working combination for `device`. The record is only read;
    /// committing the result is the caller's job.
    pub async fn probe(&self, device: &DeviceRecord) -> Result<ProbeOutcome, ProbeError> {
        if self.credentials.is_empty() {
            return Err(ProbeError::NoCredentials);
        }

        info!(device = %device.id, pairs = self.credentials.len(), "Brute forcing device credentials");

        for credential in &self.credentials {
            if let Some(outcome) = self.check_credential(device.address, credential).await {
                info!(
                    device = %device.id,
                    username = %outcome.credential.username,
                    auth = %outcome.auth_strategy,
                    scrape = %outcome.scrape_strategy,
                    "Credential discovery succeeded"
                );
                return Ok(outcome);
            }
        }

        Err(ProbeError::Exhausted {
            device: device.id.clone(),
            tried: self.credentials.len(),
        })
    }

    /// Try one credential pair against every auth strategy, then every scraper
    async fn check_credential(&self, address: IpAddr, credential: &Credential) -> Option<ProbeOutcome> {
        let (auth_strategy, token) = self.find_auth_strategy(address, credential).await?;
        let scrape_strategy = self.find_scrape_strategy(address, &token).await?;
        Some(ProbeOutcome {
            credential: credential.clone(),
            auth_strategy,
            scrape_strategy,
            token,
        })
    }

    async fn find_auth_strategy(
        &self,
        address: IpAddr,
        credential: &Credential,
    ) -> Option<(String, String)> {
        for (name, strategy) in self.auth.iter() {
            let result = match strategy.authenticate(address, credential).await {
                Ok(token) if token.is_empty() => Err(StrategyError::EmptyToken),
                other => other,
            };
            match result {
                Ok(token) => {
                    debug!(%address, auth = name, username = %credential.username, "Auth strategy accepted credentials");
                    return Some((name.to_string(), token));
                }
                Err(e) => {
                    debug!(%address, auth = name, username = %credential.username, error = %e, "Auth strategy failed");
                }
            }
        }
        None
    }

    async fn find_scrape_strategy(&self, address: IpAddr, token: &str) -> Option<String> {
        for (name, strategy) in self.scrape.iter() {
            // The verified payload is not kept; the agent scrapes again on its next pass.
            match strategy.scrape(address, token).await {
                Ok(readings) => {
                    debug!(%address, scrape = name, fields = readings.len(), "Scrape strategy succeeded");
                    return Some(name.to_string());
                }
                Err(e) => {
                    debug!(%address, scrape = name, error = %e, "Scrape strategy failed");
                }
            }
        }
        None
    }
}
